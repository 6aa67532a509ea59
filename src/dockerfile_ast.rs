//! The boundary to "the Dockerfile AST parser": given Dockerfile text,
//! return the ordered list of image references named in `FROM`
//! instructions.
//!
//! A full parser (handling line continuations, `ARG`-based image names,
//! comments mid-instruction, etc.) is out of this crate's scope; this
//! module implements enough of the instruction grammar to drive
//! [`crate::platform_policy`] correctly, and is written behind a trait so
//! a fuller parser can be substituted without touching any caller.

use std::collections::HashSet;

/// A single `FROM` reference found in a Dockerfile, with enough context
/// to tell a real registry image apart from a reference to an earlier
/// build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromReference {
    /// The image reference as written (e.g. `alpine:3.19`, `scratch`, or
    /// the name of a previous `AS <name>` stage).
    pub image_ref: String,
    /// `Some(name)` if this `FROM` instruction stages itself with `AS
    /// <name>`.
    pub stage_name: Option<String>,
    /// True if `image_ref` refers to an earlier stage rather than a
    /// registry image.
    pub is_stage_reference: bool,
}

/// The seam other components depend on instead of calling
/// [`from_references`] directly, so tests and future integrations can
/// substitute a fuller parser.
pub trait DockerfileParser {
    fn from_references(&self, dockerfile: &str) -> Vec<FromReference>;
}

/// The reference implementation: a line-oriented scan for `FROM`
/// instructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleDockerfileParser;

impl DockerfileParser for SimpleDockerfileParser {
    fn from_references(&self, dockerfile: &str) -> Vec<FromReference> {
        from_references(dockerfile)
    }
}

/// Scans `dockerfile` for `FROM` instructions, in order, stripping any
/// leading `--platform=...` flag and recognizing multi-stage `AS <name>`
/// clauses. References to a previously-declared stage name are marked
/// `is_stage_reference` so callers (platform policy, registry lookups)
/// can skip them — they are never real registry images.
pub fn from_references(dockerfile: &str) -> Vec<FromReference> {
    let mut known_stages: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for raw_line in dockerfile.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(instr) = tokens.next() else { continue };
        if !instr.eq_ignore_ascii_case("FROM") {
            continue;
        }

        let rest: Vec<&str> = tokens.collect();
        let mut idx = 0;
        // skip any number of leading `--flag` / `--flag=value` tokens (only
        // `--platform=` is meaningful to us, but docker accepts other
        // build-time flags on FROM too)
        while idx < rest.len() && rest[idx].starts_with("--") {
            idx += 1;
        }
        let Some(image_ref) = rest.get(idx).map(|s| s.to_string()) else {
            continue;
        };

        let mut stage_name = None;
        if let (Some(as_kw), Some(name)) = (rest.get(idx + 1), rest.get(idx + 2)) {
            if as_kw.eq_ignore_ascii_case("AS") {
                stage_name = Some((*name).to_string());
            }
        }

        let is_stage_reference = known_stages.contains(&image_ref);
        if let Some(name) = &stage_name {
            known_stages.insert(name.clone());
        }

        out.push(FromReference {
            image_ref,
            stage_name,
            is_stage_reference,
        });
    }

    out
}
