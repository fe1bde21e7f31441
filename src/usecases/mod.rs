pub mod canvas;
pub mod history;
