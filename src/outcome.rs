use serde::{Deserialize, Serialize};

/// Protocol outcomes, ordered by their numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationResultCode {
    Allowed,
    ValidToken,
    InvalidToken,
    ExpiredToken,
    UnexpectedToken,
    MalformedToken,
    RejectedMatch,
    RejectedCleanSpaceHash,
    FailedCommunication,
}

impl ValidationResultCode {
    pub fn code(self) -> i8 {
        match self {
            ValidationResultCode::Allowed => 1,
            ValidationResultCode::ValidToken => 0,
            ValidationResultCode::InvalidToken => -1,
            ValidationResultCode::ExpiredToken => -2,
            ValidationResultCode::UnexpectedToken => -3,
            ValidationResultCode::MalformedToken => -4,
            ValidationResultCode::RejectedMatch => -5,
            ValidationResultCode::RejectedCleanSpaceHash => -6,
            ValidationResultCode::FailedCommunication => -7,
        }
    }

    pub fn is_token_failure(self) -> bool {
        matches!(
            self,
            ValidationResultCode::InvalidToken
                | ValidationResultCode::ExpiredToken
                | ValidationResultCode::UnexpectedToken
                | ValidationResultCode::MalformedToken
        )
    }

    /// Human-readable reason sent to rejected clients.
    pub fn reason(self) -> &'static str {
        match self {
            ValidationResultCode::Allowed => "Plugin list accepted",
            ValidationResultCode::ValidToken => "Token accepted",
            ValidationResultCode::InvalidToken => "Validation token was not issued by this server",
            ValidationResultCode::ExpiredToken => "Validation token expired, try reconnecting",
            ValidationResultCode::UnexpectedToken => "No validation was pending for this client",
            ValidationResultCode::MalformedToken => "Validation token could not be read",
            ValidationResultCode::RejectedMatch => {
                "One or more installed plugins are not permitted on this server"
            }
            ValidationResultCode::RejectedCleanSpaceHash => {
                "The security plugin is missing or has been modified"
            }
            ValidationResultCode::FailedCommunication => {
                "Validation could not be completed, try reconnecting"
            }
        }
    }
}

impl PartialOrd for ValidationResultCode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValidationResultCode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.code().cmp(&other.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResultData {
    pub success: bool,
    pub code: ValidationResultCode,
    pub plugin_list: Vec<String>,
}

impl ValidationResultData {
    pub fn allowed(plugin_list: Vec<String>) -> Self {
        Self {
            success: true,
            code: ValidationResultCode::Allowed,
            plugin_list,
        }
    }

    pub fn rejected(code: ValidationResultCode, plugin_list: Vec<String>) -> Self {
        Self {
            success: false,
            code,
            plugin_list,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_totally_ordered_by_value() {
        assert!(ValidationResultCode::Allowed > ValidationResultCode::ValidToken);
        assert!(ValidationResultCode::ValidToken > ValidationResultCode::InvalidToken);
        assert!(
            ValidationResultCode::RejectedCleanSpaceHash
                > ValidationResultCode::FailedCommunication
        );
        assert_eq!(ValidationResultCode::RejectedMatch.code(), -5);
    }

    #[test]
    fn token_failures() {
        assert!(ValidationResultCode::ExpiredToken.is_token_failure());
        assert!(!ValidationResultCode::RejectedMatch.is_token_failure());
        assert!(!ValidationResultCode::ValidToken.is_token_failure());
    }
}
