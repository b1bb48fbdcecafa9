pub mod delay_fan_out;
pub mod duplicate;
pub mod name_resolver;
