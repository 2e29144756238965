pub mod clock;
pub mod credentials;
pub mod executor;
pub mod misfire;
pub mod rules;
pub mod trigger_compiler;
