//! Deployment-time check that the redirection actually covers the guest
//! runtime.
//!
//! A call site that never sees the wrapper header resolves to the real
//! host primitive and silently skips the sandbox. Nothing at runtime can
//! detect that, so the interpreter source tree is scanned before it ships:
//! every use of a redirected name, or of a macro expanding to one, must
//! come after the wrapper header has been included (directly or through
//! another header of the tree), and no file may `#undef` a redirected name.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, warn};

use super::header::{REDIRECTED_SYMBOLS, WRAPPER_HEADER_NAME};

const SOURCE_EXTENSIONS: &[&str] = &["c", "h", "cc", "cpp", "hpp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassKind {
    /// `fwrite(...)` reached without the redirection in effect.
    Call,
    /// Name used as a value (function pointer) without the redirection.
    Reference,
    /// `#undef fwrite` removes the redirection for the rest of the unit.
    Undef,
}

/// A place where guest code reaches a host primitive directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bypass {
    pub file: PathBuf,
    pub line: usize,
    pub symbol: String,
    /// Macro whose expansion reaches `symbol`, for indirect uses.
    pub via: Option<String>,
    pub kind: BypassKind,
}

impl fmt::Display for Bypass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            BypassKind::Call => "unredirected call to",
            BypassKind::Reference => "unredirected reference to",
            BypassKind::Undef => "#undef of",
        };
        write!(f, "{}:{}: {what} {}", self.file.display(), self.line, self.symbol)?;
        if let Some(via) = &self.via {
            write!(f, " (through macro {via})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindingReport {
    pub files_scanned: usize,
    pub bypasses: Vec<Bypass>,
}

impl BindingReport {
    /// True when every call site goes through the mediator.
    pub fn is_complete(&self) -> bool {
        self.bypasses.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AuditOptions {
    /// Header file name that carries the redirection.
    pub header_name: String,
    /// The build injects the header into every unit (`-include`), so only
    /// `#undef`s can break the redirection.
    pub forced_include: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            header_name: WRAPPER_HEADER_NAME.to_string(),
            forced_include: false,
        }
    }
}

/// What one source file contributes to the audit.
#[derive(Debug, Default)]
struct SourceScan {
    /// Quoted includes: (line, path as written)
    includes: Vec<(usize, String)>,
    /// `#define`s: (macro name, identifiers of its body)
    defines: Vec<(String, Vec<String>)>,
    undefs: Vec<(usize, String)>,
    /// Source with comments and literals blanked.
    cleaned: String,
}

/// A use of a redirected symbol, possibly through a macro expanding to it.
#[derive(Debug)]
struct Use {
    line: usize,
    symbol: String,
    via: Option<String>,
    kind: BypassKind,
}

/// Scans a single source text. Uses before `header_name` is included are
/// reported; includes of other headers are not followed, and only macros
/// defined in this text are expanded.
pub fn audit_source(file: &Path, source: &str, options: &AuditOptions) -> Vec<Bypass> {
    let scan = scan_source(source);
    let covered_from = if options.forced_include {
        Some(0)
    } else {
        scan.includes
            .iter()
            .filter(|(_, included)| names_header(included, &options.header_name))
            .map(|(line, _)| *line)
            .min()
    };
    let expansions = macro_expansions(std::iter::once(&scan));
    collect_bypasses(file, &scan, &expansions, covered_from)
}

/// Scans every C/C++ source below `root`.
pub fn audit_tree(root: &Path, options: &AuditOptions) -> Result<BindingReport> {
    let mut files = Vec::new();
    collect_sources(root, &mut files)?;
    files.sort();

    let mut scans = Vec::with_capacity(files.len());
    for file in files {
        let bytes = std::fs::read(&file)?;
        let source = String::from_utf8_lossy(&bytes);
        debug!("Scanning {}", file.display());
        scans.push((file, scan_source(&source)));
    }

    let coverage = if options.forced_include {
        HashMap::new()
    } else {
        resolve_coverage(&scans, &options.header_name)
    };
    let expansions = macro_expansions(scans.iter().map(|(_, scan)| scan));
    debug!("{} macros expand to redirected symbols", expansions.len());

    let mut report = BindingReport {
        files_scanned: scans.len(),
        bypasses: Vec::new(),
    };
    for (file, scan) in &scans {
        let covered_from = if options.forced_include {
            Some(0)
        } else {
            coverage.get(file).copied()
        };
        report
            .bypasses
            .extend(collect_bypasses(file, scan, &expansions, covered_from));
    }

    if report.is_complete() {
        info!(
            "Binding audit: {} files, redirection complete",
            report.files_scanned
        );
    } else {
        warn!(
            "Binding audit: {} files, {} bypasses",
            report.files_scanned,
            report.bypasses.len()
        );
    }
    Ok(report)
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_sources(&path, out)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn names_header(path: &str, header_name: &str) -> bool {
    Path::new(path)
        .file_name()
        .is_some_and(|name| name == header_name)
}

/// Lexically resolves `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Scanned files a quoted include can refer to. The including file's own
/// directory wins; otherwise the include path may sit below any directory
/// of the tree (an `-I` path).
fn include_candidates<'a>(from: &Path, included: &str, files: &'a [&'a Path]) -> Vec<&'a Path> {
    let local = normalize(&from.parent().unwrap_or(Path::new("")).join(included));
    if let Some(file) = files.iter().find(|file| **file == local) {
        return vec![*file];
    }
    files
        .iter()
        .filter(|file| file.ends_with(included))
        .copied()
        .collect()
}

/// Line from which each file sees the redirection. The wrapper header
/// covers itself; a file that includes a covered header is covered from
/// that include on. An include matching several files of the tree counts
/// only when all of them are covered. Iterates to a fixpoint.
fn resolve_coverage(
    scans: &[(PathBuf, SourceScan)],
    header_name: &str,
) -> HashMap<PathBuf, usize> {
    let files: Vec<&Path> = scans.iter().map(|(file, _)| file.as_path()).collect();
    let mut coverage: HashMap<PathBuf, usize> = files
        .iter()
        .filter(|file| file.file_name().is_some_and(|name| name == header_name))
        .map(|file| (file.to_path_buf(), 0))
        .collect();

    loop {
        let mut changed = false;
        for (file, scan) in scans {
            let first = scan
                .includes
                .iter()
                .filter(|(_, included)| {
                    if names_header(included, header_name) {
                        return true;
                    }
                    let candidates = include_candidates(file, included, &files);
                    !candidates.is_empty()
                        && candidates.iter().all(|c| coverage.contains_key(*c))
                })
                .map(|(line, _)| *line)
                .min();
            if let Some(line) = first {
                let entry = coverage.entry(file.clone()).or_insert(usize::MAX);
                if line < *entry {
                    *entry = line;
                    changed = true;
                }
            }
        }
        if !changed {
            return coverage;
        }
    }
}

/// Macro name -> redirected symbol its expansion reaches, directly or
/// through other macros.
fn macro_expansions<'a>(scans: impl IntoIterator<Item = &'a SourceScan>) -> HashMap<String, String> {
    let defines: Vec<&(String, Vec<String>)> =
        scans.into_iter().flat_map(|scan| scan.defines.iter()).collect();
    let mut expansions: HashMap<String, String> = HashMap::new();

    loop {
        let mut changed = false;
        for (name, body) in &defines {
            if expansions.contains_key(name) {
                continue;
            }
            let reached = body.iter().find_map(|ident| {
                if is_redirected(ident) {
                    Some(ident.clone())
                } else {
                    expansions.get(ident).cloned()
                }
            });
            if let Some(symbol) = reached {
                expansions.insert(name.clone(), symbol);
                changed = true;
            }
        }
        if !changed {
            return expansions;
        }
    }
}

fn collect_bypasses(
    file: &Path,
    scan: &SourceScan,
    expansions: &HashMap<String, String>,
    covered_from: Option<usize>,
) -> Vec<Bypass> {
    let mut bypasses: Vec<Bypass> = find_uses(&scan.cleaned, expansions)
        .into_iter()
        .filter(|u| covered_from.map_or(true, |from| u.line < from))
        .map(|u| Bypass {
            file: file.to_path_buf(),
            line: u.line,
            symbol: u.symbol,
            via: u.via,
            kind: u.kind,
        })
        .collect();

    bypasses.extend(scan.undefs.iter().map(|(line, symbol)| Bypass {
        file: file.to_path_buf(),
        line: *line,
        symbol: symbol.clone(),
        via: None,
        kind: BypassKind::Undef,
    }));
    bypasses.sort_by_key(|b| b.line);
    bypasses
}

fn is_redirected(ident: &str) -> bool {
    REDIRECTED_SYMBOLS.iter().any(|(name, _)| *name == ident)
}

/// One line of cleaned source, split into code and preprocessor lines.
enum SourceLine<'a> {
    Code(&'a str),
    /// First line of a directive, with the text after `#`.
    Directive(&'a str),
    /// Backslash continuation of the directive above.
    Continuation(&'a str),
}

fn classify_lines(cleaned: &str) -> Vec<SourceLine<'_>> {
    let mut lines = Vec::new();
    let mut in_directive = false;
    for line in cleaned.lines() {
        let trimmed = line.trim_start();
        let classified = if in_directive {
            SourceLine::Continuation(line)
        } else if let Some(directive) = trimmed.strip_prefix('#') {
            SourceLine::Directive(directive.trim_start())
        } else {
            SourceLine::Code(line)
        };
        in_directive = !matches!(classified, SourceLine::Code(_)) && line.trim_end().ends_with('\\');
        lines.push(classified);
    }
    lines
}

fn scan_source(source: &str) -> SourceScan {
    let mut scan = SourceScan {
        cleaned: strip_comments_and_literals(source),
        ..Default::default()
    };
    let raw_lines: Vec<&str> = source.lines().collect();
    // Index into `scan.defines` while a #define continues on the next line.
    let mut open_define: Option<usize> = None;

    for (idx, line) in classify_lines(&scan.cleaned).into_iter().enumerate() {
        let line_no = idx + 1;
        match line {
            SourceLine::Code(_) => open_define = None,
            SourceLine::Continuation(text) => {
                if let Some(i) = open_define {
                    scan.defines[i]
                        .1
                        .extend(identifiers(text).into_iter().map(|(_, _, ident)| ident));
                }
            }
            SourceLine::Directive(directive) => {
                open_define = None;
                if directive.starts_with("include") {
                    // Literals are blanked in `cleaned`; the name comes from the raw line.
                    if let Some(path) = raw_lines.get(idx).and_then(|raw| quoted_include(raw)) {
                        scan.includes.push((line_no, path));
                    }
                } else if let Some(rest) = directive.strip_prefix("define") {
                    let mut idents = identifiers(rest).into_iter().map(|(_, _, ident)| ident);
                    // The wrapper's own `#define fwrite fwrite_sandbox` is the redirection.
                    if let Some(name) = idents.next().filter(|name| !is_redirected(name)) {
                        scan.defines.push((name, idents.collect()));
                        open_define = Some(scan.defines.len() - 1);
                    }
                } else if let Some(rest) = directive.strip_prefix("undef") {
                    let name = rest.trim();
                    if is_redirected(name) {
                        scan.undefs.push((line_no, name.to_string()));
                    }
                }
            }
        }
    }
    scan
}

/// Identifiers of one line: (start, end, name), in char offsets. Numeric
/// literals like 0x1f are skipped so their tail is not an identifier.
fn identifiers(line: &str) -> Vec<(usize, usize, String)> {
    let chars: Vec<char> = line.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_alphabetic() || c == '_' || c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            if !c.is_ascii_digit() {
                out.push((start, i, chars[start..i].iter().collect()));
            }
        } else {
            i += 1;
        }
    }
    out
}

/// Every use of a redirected symbol in code lines, directly or through a
/// macro from `expansions`. Macro bodies are checked where they expand.
fn find_uses(cleaned: &str, expansions: &HashMap<String, String>) -> Vec<Use> {
    let mut uses = Vec::new();
    for (idx, line) in classify_lines(cleaned).into_iter().enumerate() {
        let SourceLine::Code(line) = line else {
            continue;
        };
        let line_no = idx + 1;
        let chars: Vec<char> = line.chars().collect();
        for (start, end, ident) in identifiers(line) {
            let (symbol, via) = if is_redirected(&ident) {
                (ident, None)
            } else if let Some(symbol) = expansions.get(&ident) {
                (symbol.clone(), Some(ident))
            } else {
                continue;
            };
            if is_member_access(&chars[..start]) {
                continue;
            }
            let kind = if next_significant(&chars[end..], line_no, cleaned) == Some('(') {
                BypassKind::Call
            } else {
                BypassKind::Reference
            };
            uses.push(Use {
                line: line_no,
                symbol,
                via,
                kind,
            });
        }
    }
    uses
}

/// `s.fwrite` / `p->fwrite` are struct members, not the libc symbol.
fn is_member_access(before: &[char]) -> bool {
    let mut rev = before.iter().rev().skip_while(|c| c.is_whitespace());
    match rev.next() {
        Some('.') => true,
        Some('>') => rev.next() == Some(&'-'),
        _ => false,
    }
}

/// First non-whitespace character after an identifier, looking past the
/// end of the line if needed.
fn next_significant(rest: &[char], line_no: usize, cleaned: &str) -> Option<char> {
    if let Some(c) = rest.iter().find(|c| !c.is_whitespace()) {
        return Some(*c);
    }
    cleaned
        .lines()
        .skip(line_no)
        .flat_map(|line| line.chars())
        .find(|c| !c.is_whitespace())
}

fn quoted_include(raw: &str) -> Option<String> {
    let start = raw.find('"')? + 1;
    let end = start + raw[start..].find('"')?;
    Some(raw[start..end].to_string())
}

/// Blanks comments and string/char literals, keeping line structure.
fn strip_comments_and_literals(source: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        LineComment,
        BlockComment,
        Str,
        Char,
    }

    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::BlockComment;
                }
                '"' => {
                    out.push('"');
                    state = State::Str;
                }
                '\'' => {
                    out.push('\'');
                    state = State::Char;
                }
                _ => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Code;
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = State::Code;
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::Str | State::Char => {
                let close = if state == State::Str { '"' } else { '\'' };
                if c == '\\' {
                    out.push(' ');
                    if let Some(escaped) = chars.next() {
                        out.push(if escaped == '\n' { '\n' } else { ' ' });
                    }
                } else if c == close {
                    out.push(close);
                    state = State::Code;
                } else if c == '\n' {
                    // Unterminated literal; resync at end of line.
                    out.push('\n');
                    state = State::Code;
                } else {
                    out.push(' ');
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit(source: &str) -> Vec<Bypass> {
        audit_source(Path::new("liolib.c"), source, &AuditOptions::default())
    }

    fn kinds(bypasses: &[Bypass]) -> Vec<(usize, &str, BypassKind)> {
        bypasses
            .iter()
            .map(|b| (b.line, b.symbol.as_str(), b.kind))
            .collect()
    }

    // ── Single file ─────────────────────────────────────

    #[test]
    fn test_uncovered_calls_reported() {
        let source = "\
#include <stdio.h>
static int g_write(FILE *f, const char *s, size_t l) {
  return fwrite(s, 1, l, f) == l;
}
static int os_execute(const char *cmd) {
  return system (cmd);
}
";
        assert_eq!(
            kinds(&audit(source)),
            vec![(3, "fwrite", BypassKind::Call), (6, "system", BypassKind::Call)]
        );
    }

    #[test]
    fn test_covered_file_is_clean() {
        let source = "\
#include \"stdlibrary_wrapper.h\"
int f(FILE *out) { return fwrite(\"x\", 1, 1, out); }
int g(void) { return system(\"ls\"); }
";
        assert!(audit(source).is_empty());
    }

    #[test]
    fn test_use_before_include_reported() {
        let source = "\
int early(void) { return system(\"ls\"); }
#include \"src/stdlibrary_wrapper.h\"
int late(void) { return system(\"ls\"); }
";
        assert_eq!(kinds(&audit(source)), vec![(1, "system", BypassKind::Call)]);
    }

    #[test]
    fn test_undef_reported_even_when_covered() {
        let source = "\
#include \"stdlibrary_wrapper.h\"
#  undef fwrite
#undef BUFSIZ
";
        assert_eq!(kinds(&audit(source)), vec![(2, "fwrite", BypassKind::Undef)]);
    }

    #[test]
    fn test_comments_and_strings_ignored() {
        let source = "\
/* fwrite(buf, 1, n, f) is wrapped elsewhere */
// system(\"rm -rf /\")
const char *msg = \"call system(cmd) here\";
char c = 'f';
";
        assert!(audit(source).is_empty());
    }

    #[test]
    fn test_member_access_and_longer_names_ignored() {
        let source = "\
int a(struct io *io) { return io->fwrite(0, 1, 1, 0) + io . system(0); }
int b(void) { return fwrite_sandbox(0, 1, 1, 0) + my_system(0) + system2(0); }
";
        assert!(audit(source).is_empty());
    }

    #[test]
    fn test_function_pointer_reference() {
        let source = "size_t (*w)(const void *, size_t, size_t, FILE *) = fwrite;\n";
        assert_eq!(kinds(&audit(source)), vec![(1, "fwrite", BypassKind::Reference)]);
    }

    #[test]
    fn test_call_with_paren_on_next_line() {
        let source = "int x = system\n  (\"ls\");\n";
        assert_eq!(kinds(&audit(source)), vec![(1, "system", BypassKind::Call)]);
    }

    #[test]
    fn test_unused_macro_is_not_a_use() {
        let source = "\
#define lua_writestring(s,l) \\
    fwrite((s), sizeof(char), (l), stdout)
int x;
";
        assert!(audit(source).is_empty());
    }

    #[test]
    fn test_macro_expanding_to_symbol_is_a_use() {
        let source = "\
#define l_system(cmd)\tsystem(cmd)
#define l_run(cmd) l_system(cmd)
int a(const char *c) { return l_run(c); }
int b(const char *c) { return l_system(c); }
";
        let bypasses = audit(source);
        assert_eq!(
            kinds(&bypasses),
            vec![(3, "system", BypassKind::Call), (4, "system", BypassKind::Call)]
        );
        assert_eq!(bypasses[0].via.as_deref(), Some("l_run"));
        assert_eq!(bypasses[1].via.as_deref(), Some("l_system"));
    }

    #[test]
    fn test_macro_use_after_include_is_clean() {
        let source = "\
#define lua_writeline() fwrite(\"\\n\", 1, 1, stdout)
#include \"stdlibrary_wrapper.h\"
void p(void) { lua_writeline(); }
";
        assert!(audit(source).is_empty());
    }

    #[test]
    fn test_forced_include_only_flags_undef() {
        let options = AuditOptions {
            forced_include: true,
            ..Default::default()
        };
        let source = "int f(void) { return system(\"ls\"); }\n#undef system\n";
        let bypasses = audit_source(Path::new("loslib.c"), source, &options);
        assert_eq!(kinds(&bypasses), vec![(2, "system", BypassKind::Undef)]);
    }

    #[test]
    fn test_bypass_display() {
        let bypass = Bypass {
            file: PathBuf::from("src/loslib.c"),
            line: 42,
            symbol: "system".to_string(),
            via: None,
            kind: BypassKind::Call,
        };
        assert_eq!(
            bypass.to_string(),
            "src/loslib.c:42: unredirected call to system"
        );

        let through_macro = Bypass {
            via: Some("l_system".to_string()),
            ..bypass
        };
        assert_eq!(
            through_macro.to_string(),
            "src/loslib.c:42: unredirected call to system (through macro l_system)"
        );
    }

    // ── Source tree ─────────────────────────────────────

    #[test]
    fn test_tree_transitive_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("stdlibrary_wrapper.h"), crate::binding::render_wrapper_header())
            .unwrap();
        std::fs::write(
            src.join("luaconf.h"),
            "#include \"stdlibrary_wrapper.h\"\n#define LUA_IDSIZE 60\n",
        )
        .unwrap();
        std::fs::write(
            src.join("liolib.c"),
            "#include \"luaconf.h\"\nint w(FILE *f) { return fwrite(\"a\", 1, 1, f); }\n",
        )
        .unwrap();
        std::fs::write(
            src.join("loslib.c"),
            "#include <stdlib.h>\nint e(const char *c) { return system(c); }\n",
        )
        .unwrap();
        std::fs::write(src.join("README.txt"), "system(\"x\")\n").unwrap();

        let report = audit_tree(dir.path(), &AuditOptions::default()).unwrap();
        assert_eq!(report.files_scanned, 4);
        assert!(!report.is_complete());
        assert_eq!(report.bypasses.len(), 1);
        assert_eq!(report.bypasses[0].file, src.join("loslib.c"));
        assert_eq!(report.bypasses[0].line, 2);
        assert_eq!(report.bypasses[0].symbol, "system");
    }

    #[test]
    fn test_tree_fully_covered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lauxlib.c"),
            "#include \"stdlibrary_wrapper.h\"\nvoid p(const char *s) { fwrite(s, 1, 1, stderr); }\n",
        )
        .unwrap();

        let report = audit_tree(dir.path(), &AuditOptions::default()).unwrap();
        assert_eq!(report.files_scanned, 1);
        assert!(report.is_complete());
    }

    #[test]
    fn test_tree_macro_from_uncovered_header() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lauxlib.h"),
            "#define lua_writestring(s,l)   fwrite((s), sizeof(char), (l), stdout)\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("lbaselib.c"),
            "#include \"lauxlib.h\"\nstatic void p(const char *s) {\n  lua_writestring(s, 1);\n}\n",
        )
        .unwrap();

        let report = audit_tree(dir.path(), &AuditOptions::default()).unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.bypasses.len(), 1);
        let bypass = &report.bypasses[0];
        assert_eq!(bypass.file, dir.path().join("lbaselib.c"));
        assert_eq!(bypass.line, 3);
        assert_eq!(bypass.symbol, "fwrite");
        assert_eq!(bypass.via.as_deref(), Some("lua_writestring"));

        // Covering the header covers every file that includes it
        std::fs::write(
            dir.path().join("lauxlib.h"),
            "#include \"stdlibrary_wrapper.h\"\n#define lua_writestring(s,l)   fwrite((s), sizeof(char), (l), stdout)\n",
        )
        .unwrap();
        let report = audit_tree(dir.path(), &AuditOptions::default()).unwrap();
        assert!(report.is_complete(), "{:?}", report.bypasses);
    }

    #[test]
    fn test_tree_same_header_name_in_two_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let lua = dir.path().join("lua");
        let host = dir.path().join("host");
        std::fs::create_dir_all(&lua).unwrap();
        std::fs::create_dir_all(&host).unwrap();
        std::fs::write(lua.join("config.h"), "#include \"stdlibrary_wrapper.h\"\n").unwrap();
        std::fs::write(host.join("config.h"), "#define HOST 1\n").unwrap();
        std::fs::write(
            lua.join("lio.c"),
            "#include \"config.h\"\nint w(FILE *f) { return fwrite(\"a\", 1, 1, f); }\n",
        )
        .unwrap();
        std::fs::write(
            host.join("run.c"),
            "#include \"config.h\"\nint e(const char *c) { return system(c); }\n",
        )
        .unwrap();
        // Included through a search path: ambiguous, so not covered
        std::fs::write(
            dir.path().join("main.c"),
            "#include \"config.h\"\nint m(void) { return system(\"ls\"); }\n",
        )
        .unwrap();

        let report = audit_tree(dir.path(), &AuditOptions::default()).unwrap();
        let files: Vec<PathBuf> = report.bypasses.iter().map(|b| b.file.clone()).collect();
        assert_eq!(files, vec![host.join("run.c"), dir.path().join("main.c")]);
    }

    #[test]
    fn test_include_relative_to_including_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let include = dir.path().join("include");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&include).unwrap();
        std::fs::write(include.join("sandbox.h"), "#include \"stdlibrary_wrapper.h\"\n").unwrap();
        std::fs::write(
            src.join("los.c"),
            "#include \"../include/sandbox.h\"\nint e(const char *c) { return system(c); }\n",
        )
        .unwrap();

        let report = audit_tree(dir.path(), &AuditOptions::default()).unwrap();
        assert!(report.is_complete(), "{:?}", report.bypasses);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("src/../include/a.h")), PathBuf::from("include/a.h"));
        assert_eq!(normalize(Path::new("./a/./b.h")), PathBuf::from("a/b.h"));
        assert_eq!(normalize(Path::new("../lua/src/../x.h")), PathBuf::from("../lua/x.h"));
    }

    #[test]
    fn test_tree_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(audit_tree(&dir.path().join("absent"), &AuditOptions::default()).is_err());
    }
}
