//! Bounded attempt counter for one launch/retry chain.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::SupervisorError;

/// Position of a launch inside its retry chain, always within `1..=MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Attempt(u8);

impl Attempt {
    /// Highest attempt number a chain may reach.
    pub const MAX: u8 = 3;
    /// Attempt that opens every fresh chain.
    pub const FIRST: Attempt = Attempt(1);

    /// Validate a requested attempt number. Anything past [`Attempt::MAX`] is refused.
    pub fn new(value: u8) -> Result<Self, SupervisorError> {
        match value {
            0 => Ok(Self::FIRST),
            v if v <= Self::MAX => Ok(Self(v)),
            _ => Err(SupervisorError::AttemptsExhausted { max: Self::MAX }),
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_first(self) -> bool {
        self.0 == 1
    }

    pub fn is_last(self) -> bool {
        self.0 == Self::MAX
    }

    /// The following attempt in the same chain, or `None` once the bound is reached.
    pub fn next(self) -> Option<Self> {
        if self.is_last() {
            None
        } else {
            Some(Self(self.0 + 1))
        }
    }
}

impl TryFrom<u8> for Attempt {
    type Error = SupervisorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Attempt> for u8 {
    fn from(attempt: Attempt) -> Self {
        attempt.0
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, Self::MAX)
    }
}
