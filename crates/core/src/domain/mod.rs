pub mod action;
pub mod integration;
pub mod project;
pub mod prompt;
