use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Class of source institution sharing a rate-limit/retry policy profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstitutionType {
    UsUniversity,
    InternationalUniversity,
    FederalLab,
    ResearchInstitute,
}

impl InstitutionType {
    pub const ALL: [InstitutionType; 4] = [
        InstitutionType::UsUniversity,
        InstitutionType::InternationalUniversity,
        InstitutionType::FederalLab,
        InstitutionType::ResearchInstitute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstitutionType::UsUniversity => "us_university",
            InstitutionType::InternationalUniversity => "international_university",
            InstitutionType::FederalLab => "federal_lab",
            InstitutionType::ResearchInstitute => "research_institute",
        }
    }
}

impl fmt::Display for InstitutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InstitutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "us_university" => Ok(InstitutionType::UsUniversity),
            "international_university" => Ok(InstitutionType::InternationalUniversity),
            "federal_lab" => Ok(InstitutionType::FederalLab),
            "research_institute" => Ok(InstitutionType::ResearchInstitute),
            _ => Err(format!("Unknown institution type: {s}")),
        }
    }
}
