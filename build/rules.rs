//! Line rules for the source policy check run by `build.rs`.

// Which lines of a match are actually violations.
#[derive(Clone, Copy)]
pub enum Rule {
    UnderscoreBinding,
    MarkerWord,
    StarsOutsideDocs,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    pub fn pattern(self) -> &'static str {
        match self {
            Self::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b",
            Self::MarkerWord => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|MODIFY|UPDATED|UPDATE)"
            }
            Self::StarsOutsideDocs => r"(//|/\*).*\*\*",
            Self::AllCapsComment => r"(//|/\*).*",
            Self::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::UnderscoreBinding => "underscore-prefixed bindings",
            Self::MarkerWord => "edit-marker words in comments",
            Self::StarsOutsideDocs => "'**' emphasis in plain comments",
            Self::AllCapsComment => "all-caps comments",
            Self::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            Self::UnderscoreBinding => "Use the binding or remove it; bare `_` is fine.",
            Self::MarkerWord => "Describe the code as it is, not how it changed.",
            Self::StarsOutsideDocs => "Markdown emphasis belongs in doc comments only.",
            Self::AllCapsComment => "Write comments in sentence case.",
            Self::AllowDeadCode => "Delete unused code instead of silencing the lint.",
        }
    }

    pub fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Self::UnderscoreBinding => has_underscore_identifier(line),
            Self::MarkerWord | Self::AllowDeadCode => true,
            Self::StarsOutsideDocs => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Self::AllCapsComment => match comment_text(line) {
                Some(text) => {
                    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                    letters.peek().is_some() && letters.all(char::is_uppercase)
                }
                None => false,
            },
        }
    }
}

// True when an identifier starting with `_` appears in code, outside string
// and char literals and trailing comments. Bare `_` is not an identifier here.
pub fn has_underscore_identifier(line: &str) -> bool {
    let chars: Vec<char> = line.chars().collect();
    let mut code = vec![' '; chars.len()];
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '\\' => i += 1,
                '"' => in_string = false,
                _ => {}
            }
        } else {
            match (c, chars.get(i + 1).copied(), chars.get(i + 2).copied()) {
                ('"', _, _) => in_string = true,
                ('/', Some('/'), _) => break,
                ('\'', Some('\\'), _) => {
                    i += 2;
                    while i + 1 < chars.len() && chars[i + 1] != '\'' {
                        i += 1;
                    }
                    i += 1;
                }
                ('\'', Some(_), Some('\'')) => i += 2,
                _ => code[i] = c,
            }
        }
        i += 1;
    }

    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    code.iter().enumerate().any(|(i, &c)| {
        c == '_'
            && (i == 0 || !is_ident(code[i - 1]))
            && code.get(i + 1).is_some_and(|&next| is_ident(next))
    })
}

pub fn comment_text(line: &str) -> Option<&str> {
    let start = line.find("//")?;
    Some(line[start..].trim_start_matches(['/', '!']).trim())
}
