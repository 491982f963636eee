use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Nested phase timings: `push` opens a phase under the current one, `pop`
/// closes it. Phases closed with the same name under the same parent accumulate.
#[derive(Debug)]
pub struct TreeTimer {
    root: Phase,
    open: Vec<(Vec<usize>, Instant)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Phase {
    pub name: String,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub children: Vec<Phase>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

impl Phase {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), elapsed: Duration::ZERO, children: Vec::new() }
    }
    fn at(&mut self, path: &[usize]) -> &mut Phase {
        match path.split_first() {
            None => self,
            Some((first, rest)) => self.children[*first].at(rest),
        }
    }
}

impl Default for TreeTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeTimer {
    pub fn new() -> Self {
        Self { root: Phase::new("query"), open: Vec::new() }
    }

    pub fn push(&mut self, name: &str) {
        let parent_path = self.open.last().map(|(p, _)| p.clone()).unwrap_or_default();
        let parent = self.root.at(&parent_path);
        let index = match parent.children.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                parent.children.push(Phase::new(name));
                parent.children.len() - 1
            }
        };
        let mut path = parent_path;
        path.push(index);
        self.open.push((path, Instant::now()));
    }

    /// Closes the innermost open phase; a pop without a push is ignored.
    pub fn pop(&mut self) {
        if let Some((path, started)) = self.open.pop() {
            self.root.at(&path).elapsed += started.elapsed();
        }
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Finished phases; still-open phases report the time accumulated so far.
    pub fn report(&self) -> Phase {
        self.root.clone()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write(phase: &Phase, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "{:indent$}{}: {:.3}ms", "", phase.name, phase.elapsed.as_secs_f64() * 1000.0, indent = indent)?;
            for child in &phase.children {
                write(child, indent + 2, f)?;
            }
            Ok(())
        }
        write(self, 0, f)
    }
}
