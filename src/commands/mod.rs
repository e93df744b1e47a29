pub mod compare;
pub mod experiments;
pub mod manifest;
pub mod run;
pub mod status;
