pub mod bounds;
pub mod cancel;
pub mod history;
pub mod options;
