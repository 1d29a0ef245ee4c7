pub mod project;
pub mod run;
