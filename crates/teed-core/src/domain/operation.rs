//! Operation - the closed set of actions a task can request.
//!
//! New operations are added as new variants. Everything that maps an
//! operation to behaviour (`OperationRegistry`, config lookups) matches
//! exhaustively, so a new variant does not compile until it is wired up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    BulkcmProbe,
    BulkcmSplit,
    BulkcmParse,
    MeasParse,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::BulkcmProbe,
        Operation::BulkcmSplit,
        Operation::BulkcmParse,
        Operation::MeasParse,
    ];

    /// Wire tag, e.g. `bulkcm_split`.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::BulkcmProbe => "bulkcm_probe",
            Operation::BulkcmSplit => "bulkcm_split",
            Operation::BulkcmParse => "bulkcm_parse",
            Operation::MeasParse => "meas_parse",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation '{0}'")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}
