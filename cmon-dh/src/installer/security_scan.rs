//! Static security scan of detector packages
//!
//! Default-deny: every finding fails the install and is reported back to
//! the operator. Nothing is silently stripped or rewritten.
//!
//! Three kinds of input are scanned:
//! - Python sources (`*.py`): dangerous imports and calls, sensitive
//!   paths, path escapes, file writes outside `/comm` and `/tmp`
//! - `requirements.txt`: known-vulnerable version ranges and untrusted
//!   package sources
//! - `Dockerfile`: root user, remote `ADD`, unpinned or disallowed base
//!   images, `sudo`

use super::validation::package_files;
use crate::error::Result;
use crate::runtime::dockerfile;
use std::fmt;
use std::fs;
use std::path::Path;

/// One scan finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIssue {
    pub file: String,
    pub line: usize,
    pub rule: &'static str,
    pub detail: String,
}

impl fmt::Display for ScanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "{}:{} [{}] {}", self.file, self.line, self.rule, self.detail)
        } else {
            write!(f, "{} [{}] {}", self.file, self.rule, self.detail)
        }
    }
}

/// Modules whose import alone is a finding
const FORBIDDEN_MODULES: &[(&str, &str)] = &[
    ("subprocess", "process-spawn"),
    ("os.system", "process-spawn"),
    ("os.popen", "process-spawn"),
    ("pty", "process-spawn"),
    ("socket", "raw-socket"),
    ("socketserver", "raw-socket"),
    ("ftplib", "network-client"),
    ("telnetlib", "network-client"),
    ("smtplib", "network-client"),
    ("http.client", "network-client"),
    ("http.server", "raw-socket"),
    ("urllib.request", "network-client"),
    ("xmlrpc", "network-client"),
    ("pickle", "pickling"),
    ("cPickle", "pickling"),
    ("_pickle", "pickling"),
    ("dill", "pickling"),
    ("shelve", "pickling"),
    ("marshal", "pickling"),
    ("ctypes", "native-code"),
    ("cffi", "native-code"),
    ("importlib", "dynamic-eval"),
];

/// Attribute calls that spawn processes or run code
const FORBIDDEN_CALLS: &[(&str, &str)] = &[
    ("os.system(", "process-spawn"),
    ("os.popen(", "process-spawn"),
    ("os.fork(", "process-spawn"),
    ("os.forkpty(", "process-spawn"),
    ("os.exec", "process-spawn"),
    ("os.spawn", "process-spawn"),
    ("os.posix_spawn", "process-spawn"),
];

/// Bare builtins that evaluate code
const FORBIDDEN_BUILTINS: &[(&str, &str)] = &[
    ("eval", "dynamic-eval"),
    ("exec", "dynamic-eval"),
    ("compile", "dynamic-eval"),
    ("__import__", "dynamic-eval"),
    ("breakpoint", "dynamic-eval"),
];

const SENSITIVE_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    "/proc/self",
    "/proc/1/",
    "/var/run/docker.sock",
    "docker.sock",
    "/root/",
    "/.ssh",
];

/// Write targets allowed inside the container
const WRITABLE_PREFIXES: &[&str] = &["/comm", "/tmp"];

/// (package, first fixed version)
const VULNERABLE_PACKAGES: &[(&str, &str)] = &[
    ("pillow", "10.0.1"),
    ("numpy", "1.22.0"),
    ("pyyaml", "5.4"),
    ("urllib3", "1.26.5"),
    ("requests", "2.31.0"),
    ("tensorflow", "2.11.1"),
    ("torch", "1.13.1"),
    ("opencv-python", "4.8.1.78"),
    ("protobuf", "3.18.3"),
    ("jinja2", "3.1.3"),
];

/// Package static analyser
#[derive(Debug, Clone)]
pub struct SecurityScanner {
    allowed_base_images: Vec<String>,
}

impl SecurityScanner {
    pub fn new(allowed_base_images: Vec<String>) -> Self {
        Self { allowed_base_images }
    }

    /// Scan every file of the package rooted at `root`
    pub fn scan_package(&self, root: &Path) -> Result<Vec<ScanIssue>> {
        let mut issues = Vec::new();
        for relative in package_files(root)? {
            let display = relative.to_string_lossy().replace('\\', "/");
            let file_name = relative
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let is_python = display.ends_with(".py");
            let is_requirements = file_name == "requirements.txt";
            let is_dockerfile = file_name == "Dockerfile";
            if !(is_python || is_requirements || is_dockerfile) {
                continue;
            }

            let bytes = fs::read(root.join(&relative))?;
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    issues.push(ScanIssue {
                        file: display,
                        line: 0,
                        rule: "unreadable-source",
                        detail: "source file is not valid UTF-8".to_string(),
                    });
                    continue;
                }
            };

            if is_python {
                issues.extend(scan_python(&display, &text));
            } else if is_requirements {
                issues.extend(scan_requirements(&display, &text));
            } else {
                issues.extend(self.scan_dockerfile(&display, &text));
            }
        }
        Ok(issues)
    }

    /// Dockerfile anti-patterns
    pub fn scan_dockerfile(&self, file: &str, text: &str) -> Vec<ScanIssue> {
        let mut issues = Vec::new();
        let mut last_user: Option<(usize, String)> = None;
        let issue = |line: usize, rule: &'static str, detail: String| ScanIssue {
            file: file.to_string(),
            line,
            rule,
            detail,
        };

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let instruction = parts.next().unwrap_or_default().to_ascii_uppercase();
            let rest = parts.next().unwrap_or_default().trim();

            match instruction.as_str() {
                "FROM" => {
                    for image in dockerfile::from_images(line) {
                        if let Err(e) =
                            dockerfile::validate_base_image(&image, &self.allowed_base_images)
                        {
                            issues.push(issue(line_no, "base-image", e.to_string()));
                        }
                    }
                }
                "USER" => last_user = Some((line_no, rest.to_string())),
                "ADD" => {
                    if rest.contains("http://") || rest.contains("https://") || rest.contains("git@") {
                        issues.push(issue(
                            line_no,
                            "add-url",
                            "ADD from a URL; vendor the file into the package".to_string(),
                        ));
                    }
                }
                _ => {}
            }

            if contains_word(line, "sudo") {
                issues.push(issue(line_no, "sudo", "sudo must not be installed or used".to_string()));
            }
            if line.contains("--privileged") || line.contains("chmod 4") || line.contains("chmod u+s") {
                issues.push(issue(line_no, "privilege", "privilege escalation setup".to_string()));
            }
        }

        match last_user {
            None => issues.push(issue(
                0,
                "root-user",
                "no USER instruction; container would run as root".to_string(),
            )),
            Some((line_no, user)) => {
                let name = user.split(':').next().unwrap_or_default();
                if name == "root" || name == "0" {
                    issues.push(issue(line_no, "root-user", "final USER is root".to_string()));
                }
            }
        }
        issues
    }
}

/// Scan one Python source file
pub fn scan_python(file: &str, text: &str) -> Vec<ScanIssue> {
    let mut issues = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let mut push = |rule: &'static str, detail: String| {
            issues.push(ScanIssue {
                file: file.to_string(),
                line: line_no,
                rule,
                detail,
            })
        };

        for module in imported_modules(line) {
            if let Some((forbidden, rule)) = FORBIDDEN_MODULES
                .iter()
                .find(|(m, _)| module == *m || module.starts_with(&format!("{}.", m)))
            {
                push(rule, format!("import of '{}'", forbidden));
            }
        }

        for (pattern, rule) in FORBIDDEN_CALLS {
            if find_unqualified(line, pattern).is_some() {
                push(rule, format!("call to {}", pattern.trim_end_matches('(')));
            }
        }

        for (name, rule) in FORBIDDEN_BUILTINS {
            if has_bare_call(line, name) {
                push(rule, format!("call to builtin {}()", name));
            }
        }
        // torch.load unpickles unless restricted to tensors
        if find_unqualified(line, "torch.load(").is_some() && !line.contains("weights_only=True") {
            push("pickling", "torch.load without weights_only=True".to_string());
        }
        if line.contains("getattr(__builtins__") || line.contains("__builtins__[") {
            push("dynamic-eval", "access to __builtins__".to_string());
        }

        for path in SENSITIVE_PATHS {
            if line.contains(path) {
                push("sensitive-path", format!("reference to {}", path));
            }
        }

        if line.contains("\"../") || line.contains("'../") || line.contains("..\\\\") || line.contains("os.pardir") {
            push("path-escape", "relative path leaving the working directory".to_string());
        }

        if let Some(target) = literal_write_target(line) {
            if !WRITABLE_PREFIXES.iter().any(|p| target == *p || target.starts_with(&format!("{}/", p))) {
                push(
                    "write-outside-workspace",
                    format!("file write to '{}' (only /comm and /tmp are writable)", target),
                );
            }
        }
    }
    issues
}

/// Scan a requirements file against the vulnerable-version denylist
pub fn scan_requirements(file: &str, text: &str) -> Vec<ScanIssue> {
    let mut issues = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let issue = |rule: &'static str, detail: String| ScanIssue {
            file: file.to_string(),
            line: line_no,
            rule,
            detail,
        };

        let lower = line.to_ascii_lowercase();
        if lower.starts_with("-e")
            || lower.starts_with("--index-url")
            || lower.starts_with("--extra-index-url")
            || lower.starts_with("-i ")
            || lower.starts_with("--find-links")
            || lower.contains("git+")
            || lower.contains("://")
        {
            issues.push(issue("untrusted-source", format!("'{}' installs from outside the package index", line)));
            continue;
        }
        if lower.starts_with('-') {
            continue;
        }

        let requirement = lower.split(';').next().unwrap_or_default().trim();
        let name_end = requirement
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
            .unwrap_or(requirement.len());
        let package = requirement[..name_end].replace('_', "-");
        let package = package.split('[').next().unwrap_or_default().to_string();
        let constraint = requirement[name_end..].trim();
        let constraint = match constraint.find(']') {
            Some(i) if constraint.starts_with('[') => constraint[i + 1..].trim(),
            _ => constraint,
        };

        let Some((_, fixed)) = VULNERABLE_PACKAGES.iter().find(|(p, _)| *p == package) else {
            continue;
        };
        let fixed = parse_version(fixed);

        match lowest_allowed_version(constraint) {
            None => issues.push(issue(
                "vulnerable-dependency",
                format!(
                    "'{}' is unpinned; versions below {} have known vulnerabilities",
                    package,
                    join_version(&fixed)
                ),
            )),
            Some(lowest) if compare_versions(&lowest, &fixed) == std::cmp::Ordering::Less => {
                issues.push(issue(
                    "vulnerable-dependency",
                    format!(
                        "'{}' allows {} (fixed in {})",
                        line,
                        join_version(&lowest),
                        join_version(&fixed)
                    ),
                ))
            }
            Some(_) => {}
        }
    }
    issues
}

/// Lowest version a constraint admits (`==`, `===`, `~=`, `>=`, `>`)
///
/// `None` when the constraint sets no lower bound.
fn lowest_allowed_version(constraint: &str) -> Option<Vec<u64>> {
    let mut lowest: Option<Vec<u64>> = None;
    for clause in constraint.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let version = clause.trim_start_matches(['=', '~', '>', '<', '!', ' ']);
        let operator = &clause[..clause.len() - version.len()];
        let bound = match operator.trim() {
            "==" | "===" | "~=" | ">=" | ">" => parse_version(version.trim_end_matches(".*")),
            _ => continue,
        };
        lowest = Some(match lowest {
            Some(current) if compare_versions(&current, &bound) == std::cmp::Ordering::Greater => current,
            _ => bound,
        });
    }
    lowest
}

fn parse_version(raw: &str) -> Vec<u64> {
    raw.trim()
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    std::cmp::Ordering::Equal
}

fn join_version(version: &[u64]) -> String {
    version.iter().map(u64::to_string).collect::<Vec<_>>().join(".")
}

/// Drop a trailing `#` comment that is not inside a string literal
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '#') => return &line[..i],
            _ => {}
        }
    }
    line
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Modules named by an `import`/`from` statement
fn imported_modules(line: &str) -> Vec<String> {
    if let Some(rest) = line.strip_prefix("import ") {
        rest.split(',')
            .filter_map(|part| part.split_whitespace().next())
            .map(str::to_string)
            .collect()
    } else if let Some(rest) = line.strip_prefix("from ") {
        let mut tokens = rest.split_whitespace();
        let module = tokens.next().unwrap_or_default().to_string();
        let names: Vec<String> = if tokens.next() == Some("import") {
            tokens
                .collect::<Vec<_>>()
                .join(" ")
                .trim_matches(|c| c == '(' || c == ')')
                .split(',')
                .filter_map(|n| n.split_whitespace().next())
                .map(|n| format!("{}.{}", module, n))
                .collect()
        } else {
            Vec::new()
        };
        let mut modules = vec![module];
        modules.extend(names);
        modules
    } else {
        Vec::new()
    }
}

/// Position of `pattern` not preceded by an identifier character or `.`
fn find_unqualified(line: &str, pattern: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = line[from..].find(pattern) {
        let at = from + offset;
        let preceded = line[..at]
            .chars()
            .next_back()
            .map(|c| is_ident_char(c) || c == '.')
            .unwrap_or(false);
        if !preceded {
            return Some(at);
        }
        from = at + pattern.len();
    }
    None
}

/// `name(` called as a bare builtin (not `obj.name(` or `my_name(`)
fn has_bare_call(line: &str, name: &str) -> bool {
    line.match_indices(name).any(|(at, _)| {
        let end = at + name.len();
        let preceded = line[..at]
            .chars()
            .next_back()
            .map(|c| is_ident_char(c) || c == '.')
            .unwrap_or(false);
        let followed = line[end..].chars().next().map(is_ident_char).unwrap_or(false);
        // `def exec(` declares, it does not call
        let declared = line[..at].trim_end().ends_with("def");
        !preceded && !followed && !declared && line[end..].trim_start().starts_with('(')
    })
}

fn contains_word(line: &str, word: &str) -> bool {
    line.match_indices(word).any(|(at, _)| {
        let before = line[..at].chars().next_back().map(is_ident_char).unwrap_or(false);
        let after = line[at + word.len()..].chars().next().map(is_ident_char).unwrap_or(false);
        !before && !after
    })
}

/// First argument of a bare `open(<literal>, <write mode>)` call
fn literal_write_target(line: &str) -> Option<String> {
    let at = find_unqualified(line, "open(")?;
    let args = &line[at + "open(".len()..];
    let quote = args.trim_start().chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let args = args.trim_start();
    let close = args[1..].find(quote)? + 1;
    let target = &args[1..close];
    let rest = &args[close + 1..];

    // Only a literal mode argument can be judged
    let mode_arg = rest.split(',').nth(1)?.trim();
    let mode_arg = mode_arg.strip_prefix("mode=").unwrap_or(mode_arg).trim_start();
    let mode_quote = mode_arg.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let mode = mode_arg[1..].split(mode_quote).next().unwrap_or_default();
    let mode_is_write = mode.contains(['w', 'a', 'x', '+']);

    if mode_is_write {
        Some(target.to_string())
    } else {
        None
    }
}
