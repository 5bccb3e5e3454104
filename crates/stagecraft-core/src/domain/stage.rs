//! Stage types: the closed set of artifacts a project is built from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Priority of entry stages (no prerequisite).
pub const ENTRY_STAGE_PRIORITY: i32 = 10;

/// Priority of stages that consume another stage's output.
pub const DEPENDENT_STAGE_PRIORITY: i32 = 5;

/// The category of artifact a task produces.
///
/// Stage groups:
/// - 0: `Prompts`, `Audio` (independent entry stages)
/// - 1: `Images` (needs prompts), `Subtitles` (needs audio)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Prompts,
    Audio,
    Images,
    Subtitles,
}

impl StageType {
    pub const ALL: [StageType; 4] = [
        StageType::Prompts,
        StageType::Audio,
        StageType::Images,
        StageType::Subtitles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageType::Prompts => "prompts",
            StageType::Audio => "audio",
            StageType::Images => "images",
            StageType::Subtitles => "subtitles",
        }
    }

    /// The stage whose output this stage consumes, if any.
    pub fn prerequisite(self) -> Option<StageType> {
        match self {
            StageType::Images => Some(StageType::Prompts),
            StageType::Subtitles => Some(StageType::Audio),
            StageType::Prompts | StageType::Audio => None,
        }
    }

    pub fn stage_group(self) -> i32 {
        if self.prerequisite().is_some() { 1 } else { 0 }
    }

    pub fn default_priority(self) -> i32 {
        if self.prerequisite().is_some() {
            DEPENDENT_STAGE_PRIORITY
        } else {
            ENTRY_STAGE_PRIORITY
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage type: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for StageType {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageType::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}
