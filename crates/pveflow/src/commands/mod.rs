pub mod deploy;
pub mod destroy;
mod run;
pub mod validate;
