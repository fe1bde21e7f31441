use serde::{Deserialize, Serialize};

pub const DEFAULT_LANGUAGE: &str = "en";

/// Pan offset and zoom. `scale` is always strictly positive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
        }
    }
}

impl Viewport {
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.scale.is_finite() && self.scale > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub dark_mode: bool,
    pub language: String,
    pub viewport: Viewport,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dark_mode: false,
            language: DEFAULT_LANGUAGE.to_string(),
            viewport: Viewport::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsPatch {
    pub dark_mode: Option<bool>,
    pub language: Option<String>,
    pub viewport: Option<Viewport>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Later fields win.
    pub fn merge(&mut self, other: SettingsPatch) {
        if other.dark_mode.is_some() {
            self.dark_mode = other.dark_mode;
        }
        if other.language.is_some() {
            self.language = other.language;
        }
        if other.viewport.is_some() {
            self.viewport = other.viewport;
        }
    }
}

impl Settings {
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(dark_mode) = patch.dark_mode {
            self.dark_mode = dark_mode;
        }
        if let Some(language) = patch.language.as_ref() {
            self.language = language.clone();
        }
        if let Some(viewport) = patch.viewport.filter(Viewport::is_valid) {
            self.viewport = viewport;
        }
    }

    pub fn to_patch(&self) -> SettingsPatch {
        SettingsPatch {
            dark_mode: Some(self.dark_mode),
            language: Some(self.language.clone()),
            viewport: Some(self.viewport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_ignores_invalid_viewport() {
        let mut settings = Settings::default();
        settings.apply(&SettingsPatch {
            viewport: Some(Viewport {
                x: 5.0,
                y: 5.0,
                scale: 0.0,
            }),
            dark_mode: Some(true),
            ..SettingsPatch::default()
        });
        assert_eq!(settings.viewport, Viewport::default());
        assert!(settings.dark_mode);
    }

    #[test]
    fn merge_keeps_unset_fields() {
        let mut patch = SettingsPatch {
            dark_mode: Some(true),
            ..SettingsPatch::default()
        };
        patch.merge(SettingsPatch {
            language: Some("de".to_string()),
            ..SettingsPatch::default()
        });
        assert_eq!(patch.dark_mode, Some(true));
        assert_eq!(patch.language.as_deref(), Some("de"));
    }
}
