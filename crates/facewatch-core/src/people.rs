//! People roster file: a JSON array of `{"name", "embedding"}` objects.

use std::io::ErrorKind;
use std::path::Path;

use thiserror::Error;

use crate::types::Person;

#[derive(Error, Debug)]
pub enum PeopleError {
    #[error("failed to read people file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write people file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("people file {path} is not valid roster JSON: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

/// Load the roster. A missing file yields an empty roster with a warning;
/// an unreadable or malformed one is an error.
pub fn load_people(path: &Path) -> Result<Vec<Person>, PeopleError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "people file not found; roster is empty");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(PeopleError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };

    let people: Vec<Person> =
        serde_json::from_slice(&bytes).map_err(|source| PeopleError::Json {
            path: path.display().to_string(),
            source,
        })?;

    tracing::info!(path = %path.display(), count = people.len(), "people roster loaded");
    Ok(people)
}

/// Write the roster as pretty-printed JSON, replacing any existing file.
pub fn save_people(path: &Path, people: &[Person]) -> Result<(), PeopleError> {
    let json = serde_json::to_vec_pretty(people).map_err(|source| PeopleError::Json {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| PeopleError::Write {
        path: path.display().to_string(),
        source,
    })
}
