//! Data types shared by the ranking pipeline and the storage seam.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type ExamId = i64;
pub type StudentId = i64;

/// One raw mark row as registered for an exam.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawMark {
    pub student_id: StudentId,
    pub subject_code: String,
    pub theory_mark: Option<f64>,
    pub practical_mark: Option<f64>,
    pub has_practical: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Sex {
    pub fn as_str(self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
        }
    }
}

impl FromStr for Sex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M" | "MALE" => Ok(Sex::Male),
            "F" | "FEMALE" => Ok(Sex::Female),
            other => Err(format!("unknown sex '{other}'")),
        }
    }
}

/// School ownership. `Unknown` centres only ever join the unsplit partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Government,
    Private,
    Unknown,
}

impl Ownership {
    pub fn as_str(self) -> &'static str {
        match self {
            Ownership::Government => "government",
            Ownership::Private => "private",
            Ownership::Unknown => "unknown",
        }
    }
}

impl FromStr for Ownership {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "government" | "gov" | "public" => Ok(Ownership::Government),
            "private" | "non-government" => Ok(Ownership::Private),
            "" | "unknown" => Ok(Ownership::Unknown),
            other => Err(format!("unknown ownership '{other}'")),
        }
    }
}

/// Position of a centre in the region → council → ward → centre hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Geography {
    pub region: Option<String>,
    pub council: Option<String>,
    pub ward: Option<String>,
    pub centre: Option<String>,
}

/// Join data for one student: sex, ownership of their centre, and location.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StudentProfile {
    pub student_id: StudentId,
    pub sex: Option<Sex>,
    pub ownership: Option<Ownership>,
    #[serde(flatten)]
    pub geography: Geography,
}

impl StudentProfile {
    /// Profile for a student with no join data at all.
    pub fn bare(student_id: StudentId) -> Self {
        Self {
            student_id,
            sex: None,
            ownership: None,
            geography: Geography::default(),
        }
    }
}

/// How `avg_mark`/`total_mark` are computed for an exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AveragingPolicy {
    SevenBest,
    EightBest,
    Auto,
}

impl AveragingPolicy {
    /// Fixed averaging denominator, `None` for `Auto`.
    pub fn best_n(self) -> Option<usize> {
        match self {
            AveragingPolicy::SevenBest => Some(7),
            AveragingPolicy::EightBest => Some(8),
            AveragingPolicy::Auto => None,
        }
    }
}

impl FromStr for AveragingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SEVEN_BEST" => Ok(AveragingPolicy::SevenBest),
            "EIGHT_BEST" => Ok(AveragingPolicy::EightBest),
            "AUTO" => Ok(AveragingPolicy::Auto),
            other => Err(format!("unknown averaging policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExamSettings {
    pub averaging_policy: AveragingPolicy,
    /// Overrides the configured legacy subject code for this exam.
    pub legacy_subject_code: Option<String>,
}

/// A division label as classified from summed division points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Division {
    I,
    II,
    III,
    IV,
    #[serde(rename = "0")]
    Zero,
    #[serde(rename = "ABS")]
    Absent,
    #[serde(rename = "INC")]
    Incomplete,
}

impl Division {
    pub fn as_str(self) -> &'static str {
        match self {
            Division::I => "I",
            Division::II => "II",
            Division::III => "III",
            Division::IV => "IV",
            Division::Zero => "0",
            Division::Absent => "ABS",
            Division::Incomplete => "INC",
        }
    }
}

impl fmt::Display for Division {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Division {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "I" => Ok(Division::I),
            "II" => Ok(Division::II),
            "III" => Ok(Division::III),
            "IV" => Ok(Division::IV),
            "0" | "ZERO" => Ok(Division::Zero),
            "ABS" => Ok(Division::Absent),
            "INC" => Ok(Division::Incomplete),
            other => Err(format!("unknown division '{other}'")),
        }
    }
}

/// Ranking scope. `Global` spans the whole exam (within one subject for
/// subject marks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    School,
    Ward,
    Council,
    Region,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Global,
        Scope::School,
        Scope::Ward,
        Scope::Council,
        Scope::Region,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::School => "school",
            Scope::Ward => "ward",
            Scope::Council => "council",
            Scope::Region => "region",
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| format!("unknown scope '{s}'"))
    }
}

/// Which attribute a partition is additionally split by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    All,
    Sex,
    Ownership,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::All => "all",
            Split::Sex => "sex",
            Split::Ownership => "ownership",
        }
    }
}

impl FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Split::All),
            "sex" => Ok(Split::Sex),
            "ownership" => Ok(Split::Ownership),
            other => Err(format!("unknown split '{other}'")),
        }
    }
}

/// Storage slot for one rank/out-of pair on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct RankField {
    pub scope: Scope,
    pub split: Split,
}

impl RankField {
    pub const fn new(scope: Scope, split: Split) -> Self {
        Self { scope, split }
    }
}

impl fmt::Display for RankField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.split {
            Split::All => write!(f, "{}", self.scope.as_str()),
            split => write!(f, "{}_by_{}", self.scope.as_str(), split.as_str()),
        }
    }
}

/// Competition rank and group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Position {
    pub rank: u32,
    pub out_of: u32,
}

pub type RankMap = BTreeMap<RankField, Position>;

/// Derived fields written back to one subject mark record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectUpdate {
    pub student_id: StudentId,
    pub subject_code: String,
    pub overall_mark: Option<f64>,
    pub grade: Option<String>,
    pub grade_points: Option<f64>,
    pub ranks: RankMap,
}

/// Derived fields written back to one student's composite record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeUpdate {
    pub student_id: StudentId,
    pub avg_mark: Option<f64>,
    pub total_mark: Option<f64>,
    pub division: Division,
    pub total_points: Option<u32>,
    pub ranks: RankMap,
}
