use thiserror::Error;

/// Why a submitted command was refused. `Display` is the operator-facing
/// reason and ends up verbatim in API errors and job output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandRejection {
    #[error("command is empty")]
    Empty,
    #[error("command length {len} is outside the allowed range {min}..={max}")]
    InvalidLength { len: usize, min: usize, max: usize },
    #[error("forbidden character {character:?} at byte {offset}")]
    ForbiddenCharacter { character: char, offset: usize },
    #[error("comment marker '#' at byte {offset} is not allowed")]
    CommentMarker { offset: usize },
    #[error("unterminated quote in command")]
    UnterminatedQuote,
    #[error("command too short")]
    TooShort,
    #[error("not a permitted command prefix; only 'docker compose ...' is allowed")]
    PrefixNotAllowed,
    #[error("flag '{flag}' is not allowed")]
    ForbiddenFlag { flag: String },
    #[error("flag '{flag}' requires a value")]
    MissingFlagValue { flag: String },
    #[error("missing compose subcommand; allowed: {allowed}")]
    MissingVerb { allowed: String },
    #[error("compose subcommand '{verb}' is not allowed; allowed: {allowed}")]
    VerbNotAllowed { verb: String, allowed: String },
    #[error("{flag} value '{value}' escapes the workspace")]
    PathEscapesWorkspace { flag: String, value: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stale run '{requested}' (active: {})", active.as_deref().unwrap_or("none"))]
pub struct StaleRun {
    pub requested: String,
    pub active: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("request id '{0}' is unknown, expired or already used")]
pub struct UnknownRequest(pub String);
