//! Quiz catalog loader.
//!
//! Reads a directory of UTF-8 quiz files at startup. One quiz per file:
//! the first line is the quiz name, then for each question a blank line,
//! a `Question: <prompt>` line, and an `Answers: <a>, <b>, ...` line.
//! Any malformed file is fatal; the catalog is immutable once loaded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One question with its accepted answers.
#[derive(Debug, Clone)]
pub struct Question {
    pub prompt: String,
    answers: Vec<String>,
}

impl Question {
    /// Check a client answer: case-insensitive, exact full-string match.
    pub fn accepts(&self, answer: &str) -> bool {
        self.answers.iter().any(|a| a.eq_ignore_ascii_case(answer))
    }

    #[cfg(test)]
    pub fn new(prompt: &str, answers: &[&str]) -> Self {
        Question {
            prompt: prompt.to_string(),
            answers: answers.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// One quiz: a name and a fixed, ordered question list.
#[derive(Debug, Clone)]
pub struct Quiz {
    pub name: String,
    pub questions: Vec<Question>,
}

/// The full set of quizzes served by this process.
#[derive(Debug)]
pub struct Catalog {
    quizzes: Vec<Quiz>,
}

impl Catalog {
    /// Load every quiz file in `dir`, sorted by file name so the catalog
    /// order (and therefore the wire-visible quiz indices) is stable.
    pub fn load(dir: &Path) -> Result<Catalog, CatalogError> {
        let entries = fs::read_dir(dir).map_err(|e| CatalogError::Io(dir.to_path_buf(), e))?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::Io(dir.to_path_buf(), e))?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut quizzes = Vec::with_capacity(files.len());
        for path in files {
            let contents =
                fs::read_to_string(&path).map_err(|e| CatalogError::Io(path.clone(), e))?;
            quizzes.push(parse_quiz(&path, &contents)?);
        }

        if quizzes.is_empty() {
            return Err(CatalogError::Empty(dir.to_path_buf()));
        }

        Ok(Catalog { quizzes })
    }

    #[cfg(test)]
    pub fn from_quizzes(quizzes: Vec<Quiz>) -> Catalog {
        Catalog { quizzes }
    }

    pub fn quizzes(&self) -> &[Quiz] {
        &self.quizzes
    }

    pub fn get(&self, index: usize) -> Option<&Quiz> {
        self.quizzes.get(index)
    }

    pub fn len(&self) -> usize {
        self.quizzes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quizzes.is_empty()
    }

    /// Quiz names in catalog order, for the quiz-list payload.
    pub fn names(&self) -> impl ExactSizeIterator<Item = &str> {
        self.quizzes.iter().map(|q| q.name.as_str())
    }
}

fn parse_quiz(path: &Path, contents: &str) -> Result<Quiz, CatalogError> {
    let malformed = |detail: &str| CatalogError::Malformed(path.to_path_buf(), detail.to_string());

    let mut lines = contents.lines();

    let name = lines
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| malformed("missing quiz name on first line"))?
        .to_string();

    let mut questions = Vec::new();
    loop {
        // Skip the blank separator line(s) before the next question
        let prompt_line = match lines.find(|l| !l.trim().is_empty()) {
            Some(line) => line,
            None => break,
        };

        let prompt = prompt_line
            .strip_prefix("Question: ")
            .ok_or_else(|| malformed("expected a 'Question: ' line"))?
            .trim()
            .to_string();
        if prompt.is_empty() {
            return Err(malformed("empty question prompt"));
        }

        let answers_line = lines
            .next()
            .and_then(|l| l.strip_prefix("Answers: "))
            .ok_or_else(|| malformed("question without an 'Answers: ' line"))?;

        let answers: Vec<String> = answers_line
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if answers.is_empty() {
            return Err(malformed("question with no accepted answers"));
        }

        questions.push(Question { prompt, answers });
    }

    if questions.is_empty() {
        return Err(malformed("quiz has no questions"));
    }

    Ok(Quiz { name, questions })
}

/// Catalog loading errors. All fatal at startup.
#[derive(Debug)]
pub enum CatalogError {
    Io(PathBuf, io::Error),
    Malformed(PathBuf, String),
    Empty(PathBuf),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(path, e) => {
                write!(f, "failed to read quiz path '{}': {}", path.display(), e)
            }
            CatalogError::Malformed(path, detail) => {
                write!(f, "malformed quiz file '{}': {}", path.display(), detail)
            }
            CatalogError::Empty(path) => {
                write!(f, "no quiz files found in '{}'", path.display())
            }
        }
    }
}

impl std::error::Error for CatalogError {}
