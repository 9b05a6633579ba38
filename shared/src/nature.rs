//! Payment natures, stored as small integers in the ledger.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentNature {
    Cash,
    Transfer,
    Other,
}

impl PaymentNature {
    pub fn code(self) -> i16 {
        match self {
            PaymentNature::Cash => 1,
            PaymentNature::Transfer => 2,
            PaymentNature::Other => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(PaymentNature::Cash),
            2 => Some(PaymentNature::Transfer),
            3 => Some(PaymentNature::Other),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PaymentNature::Cash => "cash",
            PaymentNature::Transfer => "transfer",
            PaymentNature::Other => "other",
        }
    }
}

impl fmt::Display for PaymentNature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
