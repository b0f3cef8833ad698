// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Device programs and kernels.
//!
//! A program is built from device source text. The front end of the
//! host-emulated device checks the source for lexical and bracket balance
//! errors, and collects the `__kernel void <name>(...)` entry points. Each
//! entry point must be bound to a host [`Kernel`] that implements its
//! semantics. Build errors are reported in a build log, one diagnostic per
//! line, in the form `line <N>: error: <message>`.

use super::device::Device;
use super::dispatcher::LaunchContext;
use super::memory::DeviceMem;
use crate::error::{ErrorKind, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Work sizes of a kernel launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchDim {
    pub global: usize,
    pub local: usize,
}

impl LaunchDim {
    pub fn new(global: usize, local: usize) -> Self {
        Self { global, local }
    }
}

#[derive(Clone, Debug)]
pub enum KernelArg {
    Mem(DeviceMem),
    Scalar(u64),
}

impl KernelArg {
    pub fn mem_at(args: &[KernelArg], index: usize) -> Result<&DeviceMem> {
        match args.get(index) {
            Some(KernelArg::Mem(mem)) => Ok(mem),
            _ => Err(ErrorKind::InvalidArgument(format!(
                "Kernel argument {} is not a memory object",
                index
            ))
            .into()),
        }
    }

    pub fn scalar_at(args: &[KernelArg], index: usize) -> Result<u64> {
        match args.get(index) {
            Some(KernelArg::Scalar(value)) => Ok(*value),
            _ => Err(ErrorKind::InvalidArgument(format!(
                "Kernel argument {} is not a scalar",
                index
            ))
            .into()),
        }
    }
}

/// The device-side semantics of a kernel entry point.
pub trait Kernel: Send + Sync {
    fn launch(&self, ctx: &LaunchContext<'_>, args: &[KernelArg]) -> Result<()>;
}

/// A kernel entry point of a built program.
#[derive(Clone)]
pub struct KernelHandle {
    name: Arc<str>,
    kernel: Arc<dyn Kernel>,
}

impl KernelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn launch(&self, ctx: &LaunchContext<'_>, args: &[KernelArg]) -> Result<()> {
        self.kernel.launch(ctx, args)
    }
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("name", &self.name)
            .finish()
    }
}

pub struct ProgramBuilder {
    source: String,
    bindings: Vec<(String, Arc<dyn Kernel>)>,
}

impl ProgramBuilder {
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self {
            source: source.into(),
            bindings: Vec::new(),
        }
    }

    /// Binds the host implementation of the entry point `name`.
    pub fn kernel(mut self, name: &str, kernel: Arc<dyn Kernel>) -> Self {
        self.bindings.push((name.to_string(), kernel));
        self
    }

    pub fn build(self, device: &Device) -> Result<Program> {
        let mut log = BuildLog::default();
        let stripped = strip_comments_and_literals(&self.source, &mut log);
        check_balance(&stripped, &mut log);
        let entry_points = find_entry_points(&stripped);

        let mut bindings: HashMap<String, Arc<dyn Kernel>> = self.bindings.into_iter().collect();
        let mut kernels = HashMap::new();
        for (name, line) in &entry_points {
            match bindings.remove(name) {
                Some(kernel) => {
                    kernels.insert(
                        name.clone(),
                        KernelHandle {
                            name: Arc::from(name.as_str()),
                            kernel,
                        },
                    );
                }
                None => log.error(*line, format!("undefined reference to kernel '{}'", name)),
            }
        }
        let mut unused: Vec<_> = bindings.keys().cloned().collect();
        unused.sort();
        for name in unused {
            log.warning(format!("kernel '{}' is not declared in the source", name));
        }

        if log.has_errors() {
            tracing::debug!(errors = log.errors, "program build failed");
            return Err(ErrorKind::BuildFailure(log.into_string()).into());
        }

        let mut names: Vec<&str> = kernels.keys().map(|k| k.as_str()).collect();
        names.sort();
        log.note(format!(
            "build succeeded for {}: {} kernel(s) [{}]",
            device.properties().name,
            names.len(),
            names.join(", ")
        ));

        Ok(Program {
            source: self.source,
            build_log: log.into_string(),
            kernels,
        })
    }
}

/// A successfully built device program.
pub struct Program {
    source: String,
    build_log: String,
    kernels: HashMap<String, KernelHandle>,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn build_log(&self) -> &str {
        &self.build_log
    }

    pub fn kernel(&self, name: &str) -> Result<KernelHandle> {
        self.kernels.get(name).cloned().ok_or_else(|| {
            ErrorKind::InvalidArgument(format!("Program has no kernel named '{}'", name)).into()
        })
    }
}

#[derive(Default)]
struct BuildLog {
    lines: Vec<String>,
    errors: usize,
}

impl BuildLog {
    fn error(&mut self, line: usize, msg: String) {
        self.errors += 1;
        self.lines.push(format!("line {}: error: {}", line, msg));
    }

    fn warning(&mut self, msg: String) {
        self.lines.push(format!("warning: {}", msg));
    }

    fn note(&mut self, msg: String) {
        self.lines.push(msg);
    }

    fn has_errors(&self) -> bool {
        self.errors > 0
    }

    fn into_string(self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Clone, Copy, PartialEq)]
enum LexState {
    Code,
    LineComment,
    BlockComment,
    Str,
    Char,
}

/// Replaces comments and literals by blanks, preserving line breaks.
fn strip_comments_and_literals(source: &str, log: &mut BuildLog) -> String {
    let mut out = String::with_capacity(source.len());
    let mut state = LexState::Code;
    let mut line = 1;
    let mut state_line = 1;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
            out.push('\n');
            match state {
                LexState::LineComment => state = LexState::Code,
                LexState::Str | LexState::Char => {
                    log.error(state_line, "missing terminating quote character".to_string());
                    state = LexState::Code;
                }
                _ => {}
            }
            continue;
        }

        match state {
            LexState::Code => match (c, chars.peek()) {
                ('/', Some('/')) => {
                    chars.next();
                    out.push_str("  ");
                    state = LexState::LineComment;
                }
                ('/', Some('*')) => {
                    chars.next();
                    out.push_str("  ");
                    state = LexState::BlockComment;
                    state_line = line;
                }
                ('"', _) => {
                    out.push(' ');
                    state = LexState::Str;
                    state_line = line;
                }
                ('\'', _) => {
                    out.push(' ');
                    state = LexState::Char;
                    state_line = line;
                }
                _ => out.push(c),
            },
            LexState::LineComment => out.push(' '),
            LexState::BlockComment => {
                out.push(' ');
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push(' ');
                    state = LexState::Code;
                }
            }
            LexState::Str | LexState::Char => {
                out.push(' ');
                let quote = if state == LexState::Str { '"' } else { '\'' };
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        if escaped == '\n' {
                            line += 1;
                            out.push('\n');
                        } else {
                            out.push(' ');
                        }
                    }
                } else if c == quote {
                    state = LexState::Code;
                }
            }
        }
    }

    match state {
        LexState::BlockComment => log.error(state_line, "unterminated comment".to_string()),
        LexState::Str | LexState::Char => {
            log.error(state_line, "missing terminating quote character".to_string())
        }
        _ => {}
    }

    out
}

fn check_balance(stripped: &str, log: &mut BuildLog) {
    let mut open: Vec<(char, usize)> = Vec::new();

    for (index, text) in stripped.lines().enumerate() {
        let line = index + 1;
        for c in text.chars() {
            match c {
                '(' | '{' | '[' => open.push((c, line)),
                ')' | '}' | ']' => {
                    let expected = match c {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match open.pop() {
                        Some((opener, _)) if opener == expected => {}
                        Some((opener, opened_at)) => log.error(
                            line,
                            format!(
                                "unexpected '{}', '{}' opened at line {} is not closed",
                                c, opener, opened_at
                            ),
                        ),
                        None => log.error(line, format!("unmatched '{}'", c)),
                    }
                }
                _ => {}
            }
        }
    }

    for (opener, line) in open {
        log.error(line, format!("'{}' is never closed", opener));
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Punct(char),
}

fn tokenize(stripped: &str) -> Vec<(Token, usize)> {
    let mut tokens = Vec::new();

    for (index, text) in stripped.lines().enumerate() {
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_alphanumeric() || c == '_' {
                let mut ident = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(ident), index + 1));
            } else if !c.is_whitespace() {
                tokens.push((Token::Punct(c), index + 1));
            }
        }
    }

    tokens
}

/// Finds the `__kernel void <name>(` declarations.
fn find_entry_points(stripped: &str) -> Vec<(String, usize)> {
    let tokens = tokenize(stripped);

    tokens
        .windows(4)
        .filter_map(|window| match window {
            [(Token::Ident(qualifier), line), (Token::Ident(ret), _), (Token::Ident(name), _), (Token::Punct('('), _)]
                if qualifier == "__kernel" && ret == "void" =>
            {
                Some((name.clone(), *line))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_strings_are_blanked() {
        let mut log = BuildLog::default();
        let stripped = strip_comments_and_literals(
            "a /* ( */ b // {\n\"}\" c '(' d",
            &mut log,
        );
        assert!(!log.has_errors());
        assert!(!stripped.contains('('));
        assert!(!stripped.contains('{'));
        assert!(!stripped.contains('}'));
        assert_eq!(stripped.lines().count(), 2);
    }

    #[test]
    fn unbalanced_brace_is_reported_with_line() {
        let mut log = BuildLog::default();
        check_balance("void f()\n{\n  if (x) {\n}\n", &mut log);
        assert!(log.has_errors());
        assert!(log.into_string().starts_with("line 2: error:"));
    }

    #[test]
    fn entry_points_are_found() {
        let source = "__kernel void\nmain_kernel(int x) {}\nstatic void helper(void) {}\n__kernel void proj() {}";
        let mut log = BuildLog::default();
        let stripped = strip_comments_and_literals(source, &mut log);
        let entries = find_entry_points(&stripped);
        assert_eq!(
            entries,
            vec![("main_kernel".to_string(), 1), ("proj".to_string(), 4)]
        );
    }

    #[test]
    fn commented_entry_point_is_ignored() {
        let mut log = BuildLog::default();
        let stripped = strip_comments_and_literals("// __kernel void f() {}\n", &mut log);
        assert!(find_entry_points(&stripped).is_empty());
    }
}
