use crate::{ConfigError, ConfigResult};

/// Validation hook every config section implements. Runs once at process
/// start; a failure here must abort startup, never surface at message
/// time.
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

pub fn validate_not_empty(value: &str, field: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

pub fn validate_positive(value: u64, field: &str) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::Validation(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

/// Consumer-group keys and queue names become parts of physical topic or
/// table keys on every transport, so the charset is restricted.
pub fn validate_group_key(value: &str, field: &str) -> ConfigResult<()> {
    validate_not_empty(value, field)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::Validation(format!(
            "{field} may only contain alphanumerics, '-', '_' and '.': got '{value}'"
        )));
    }
    Ok(())
}
