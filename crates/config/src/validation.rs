use crate::{ConfigError, ConfigResult};

pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{field} cannot be empty")));
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

    /// Identifiers end up as subject tokens.
    pub fn validate_subject_token(value: &str, field: &str) -> ConfigResult<()> {
        Self::validate_not_empty(value, field)?;
        if value
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
        {
            return Err(ConfigError::Validation(format!(
                "{field} must not contain '.', '*', '>' or whitespace"
            )));
        }
        Ok(())
    }

    pub fn validate_url(url: &str, field: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field)?;
        if !url.contains("://") {
            return Err(ConfigError::Validation(format!(
                "{field} must be a URL, got '{url}'"
            )));
        }
        Ok(())
    }
}
