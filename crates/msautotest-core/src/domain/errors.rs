use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutotestErrorCategory {
    InputValidationError,
    IoSystemError,
}

impl AutotestErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::InputValidationError => 2,
            Self::IoSystemError => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InputValidationError => "InputValidationError",
            Self::IoSystemError => "IoSystemError",
        }
    }
}

/// Harness-level failure with a stable placeholder code such as
/// `IO.RESULT_DIR` that scripts can match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutotestError {
    category: AutotestErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl AutotestError {
    pub fn new(
        category: AutotestErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn input_validation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(
            AutotestErrorCategory::InputValidationError,
            placeholder,
            message,
        )
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(AutotestErrorCategory::IoSystemError, placeholder, message)
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> String {
        format!("FATAL EXIT CODE: {}", self.exit_code())
    }
}

impl Display for AutotestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for AutotestError {}

#[cfg(test)]
mod tests {
    use super::{AutotestError, AutotestErrorCategory};

    #[test]
    fn exit_mapping_is_stable() {
        let cases = [
            (
                AutotestErrorCategory::InputValidationError,
                2,
                "InputValidationError",
            ),
            (AutotestErrorCategory::IoSystemError, 3, "IoSystemError"),
        ];

        for (category, exit_code, name) in cases {
            assert_eq!(category.exit_code(), exit_code);
            assert_eq!(category.as_str(), name);
        }
    }

    #[test]
    fn fatal_error_renders_diagnostic_lines() {
        let error = AutotestError::io_system(
            "IO.RESULT_DIR",
            "failed to create result directory 'gdal/result'",
        );

        assert_eq!(error.exit_code(), 3);
        assert_eq!(
            error.diagnostic_line(),
            "ERROR: [IO.RESULT_DIR] failed to create result directory 'gdal/result'"
        );
        assert_eq!(error.fatal_exit_line(), "FATAL EXIT CODE: 3");
        assert_eq!(
            error.to_string(),
            "IoSystemError [IO.RESULT_DIR] failed to create result directory 'gdal/result'"
        );
    }
}
