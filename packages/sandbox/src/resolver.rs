// ABOUTME: Dependency resolution from Python import statements to an install plan
// ABOUTME: Maps import names to distribution names and filters the standard library and base-image packages

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::types::Language;

/// Import names whose distribution is named differently
const MODULE_PACKAGES: &[(&str, &str)] = &[
    ("sklearn", "scikit-learn"),
    ("cv2", "opencv-python-headless"),
    ("PIL", "Pillow"),
    ("yaml", "PyYAML"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("skimage", "scikit-image"),
    ("Crypto", "pycryptodome"),
    ("jwt", "PyJWT"),
    ("serial", "pyserial"),
    ("attr", "attrs"),
    ("docx", "python-docx"),
    ("pptx", "python-pptx"),
    ("fitz", "PyMuPDF"),
    ("OpenSSL", "pyOpenSSL"),
    ("zmq", "pyzmq"),
    ("MySQLdb", "mysqlclient"),
    ("psycopg2", "psycopg2-binary"),
    ("google.protobuf", "protobuf"),
    ("magic", "python-magic"),
    ("Levenshtein", "python-Levenshtein"),
    ("telegram", "python-telegram-bot"),
    ("usb", "pyusb"),
    ("gi", "PyGObject"),
    ("win32api", "pywin32"),
];

/// Top-level modules shipped with CPython 3.10
const STDLIB_MODULES: &[&str] = &[
    "__future__", "_thread", "abc", "aifc", "argparse", "array", "ast", "asynchat", "asyncio",
    "asyncore", "atexit", "audioop", "base64", "bdb", "binascii", "bisect", "builtins", "bz2",
    "calendar", "cgi", "cgitb", "chunk", "cmath", "cmd", "code", "codecs", "codeop",
    "collections", "colorsys", "compileall", "concurrent", "configparser", "contextlib",
    "contextvars", "copy", "copyreg", "cProfile", "crypt", "csv", "ctypes", "curses",
    "dataclasses", "datetime", "dbm", "decimal", "difflib", "dis", "distutils", "doctest",
    "email", "encodings", "ensurepip", "enum", "errno", "faulthandler", "fcntl", "filecmp",
    "fileinput", "fnmatch", "fractions", "ftplib", "functools", "gc", "getopt", "getpass",
    "gettext", "glob", "graphlib", "grp", "gzip", "hashlib", "heapq", "hmac", "html", "http",
    "imaplib", "imghdr", "imp", "importlib", "inspect", "io", "ipaddress", "itertools", "json",
    "keyword", "lib2to3", "linecache", "locale", "logging", "lzma", "mailbox", "mailcap",
    "marshal", "math", "mimetypes", "mmap", "modulefinder", "msvcrt", "multiprocessing",
    "netrc", "nis", "nntplib", "numbers", "operator", "optparse", "os", "ossaudiodev",
    "pathlib", "pdb", "pickle", "pickletools", "pipes", "pkgutil", "platform", "plistlib",
    "poplib", "posix", "pprint", "profile", "pstats", "pty", "pwd", "py_compile", "pyclbr",
    "pydoc", "queue", "quopri", "random", "re", "readline", "reprlib", "resource",
    "rlcompleter", "runpy", "sched", "secrets", "select", "selectors", "shelve", "shlex",
    "shutil", "signal", "site", "smtpd", "smtplib", "sndhdr", "socket", "socketserver",
    "spwd", "sqlite3", "ssl", "stat", "statistics", "string", "stringprep", "struct",
    "subprocess", "sunau", "symtable", "sys", "sysconfig", "syslog", "tabnanny", "tarfile",
    "telnetlib", "tempfile", "termios", "textwrap", "threading", "time", "timeit", "tkinter",
    "token", "tokenize", "trace", "traceback", "tracemalloc", "tty", "turtle", "types",
    "typing", "unicodedata", "unittest", "urllib", "uu", "uuid", "venv", "warnings", "wave",
    "weakref", "webbrowser", "winreg", "winsound", "wsgiref", "xdrlib", "xml", "xmlrpc",
    "zipapp", "zipfile", "zipimport", "zlib", "zoneinfo",
];

static IMPORT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*import[ \t]+([^\n]+)$").expect("import pattern is valid"));

static FROM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+([A-Za-z_.][\w.]*)[ \t]+import\b").expect("from pattern is valid")
});

static PACKAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$").expect("package name pattern is valid")
});

static VERSION_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(==|>=|<=|~=|!=|>|<)[A-Za-z0-9.*+!_-]+(,(==|>=|<=|~=|!=|>|<)[A-Za-z0-9.*+!_-]+)*$")
        .expect("constraint pattern is valid")
});

/// How a plan entry was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencySource {
    /// Import name found in the module table
    Lookup,
    /// Import name used as the package name
    Heuristic,
    /// Listed in the request's requirements
    Explicit,
}

/// One package to make available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Top-level import that triggered this entry
    pub module: Option<String>,
    pub package: String,
    /// Version constraint such as `==1.26.4` or `>=2,<3`
    pub constraint: Option<String>,
    pub source: DependencySource,
}

impl DependencySpec {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            module: None,
            package: package.into(),
            constraint: None,
            source: DependencySource::Explicit,
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Parse a requirement such as `pandas==2.2.0` or `requests >= 2.31, <3`
    pub fn parse_requirement(requirement: &str) -> Result<Self> {
        let compact: String = requirement.chars().filter(|c| !c.is_whitespace()).collect();
        let split = compact
            .find(|c: char| matches!(c, '=' | '<' | '>' | '~' | '!'))
            .unwrap_or(compact.len());
        let (name, constraint) = compact.split_at(split);
        let spec = Self {
            module: None,
            package: name.to_string(),
            constraint: (!constraint.is_empty()).then(|| constraint.to_string()),
            source: DependencySource::Explicit,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Reject names and constraints that could smuggle arguments into an install command
    pub fn validate(&self) -> Result<()> {
        if !PACKAGE_NAME.is_match(&self.package) {
            return Err(SandboxError::Configuration(format!(
                "Invalid package name: {:?}",
                self.package
            )));
        }
        if let Some(constraint) = &self.constraint {
            if !VERSION_CONSTRAINT.is_match(constraint) {
                return Err(SandboxError::Configuration(format!(
                    "Invalid version constraint for {}: {:?}",
                    self.package, constraint
                )));
            }
        }
        Ok(())
    }

    /// PEP 503 normalized distribution name
    pub fn normalized_name(&self) -> String {
        normalize_package_name(&self.package)
    }

    /// Argument handed to the installer
    pub fn requirement(&self) -> String {
        format!("{}{}", self.package, self.constraint.as_deref().unwrap_or(""))
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.requirement())
    }
}

/// Ordered, de-duplicated list of packages for one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPlan {
    pub entries: Vec<DependencySpec>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn packages(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.package.clone()).collect()
    }
}

pub fn normalize_package_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '.' { '-' } else { c })
        .collect()
}

/// Turns source code into an [`InstallPlan`]
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    base_packages: HashSet<String>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new(["pip", "setuptools", "wheel"])
    }
}

impl DependencyResolver {
    /// `base_packages` are already present in the image and never installed
    pub fn new<I, S>(base_packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            base_packages: base_packages
                .into_iter()
                .map(|p| normalize_package_name(p.as_ref()))
                .collect(),
        }
    }

    pub fn resolve(&self, language: Language, code: &str, requirements: &[String]) -> Result<InstallPlan> {
        if !language.supports_packages() {
            if !requirements.is_empty() {
                debug!("Ignoring {} requirements for {}", requirements.len(), language);
            }
            return Ok(InstallPlan::default());
        }

        let mut plan = InstallPlan::default();
        let mut seen = HashSet::new();

        for module in scan_imports(code) {
            if is_stdlib(&module) {
                continue;
            }
            let spec = map_module(&module);
            let normalized = spec.normalized_name();
            if self.base_packages.contains(&normalized) {
                continue;
            }
            if spec.validate().is_err() {
                // Kept so the install step reports it as a failed package
                warn!("Import {:?} does not map to an installable package name", module);
            }
            if seen.insert(normalized) {
                plan.entries.push(spec);
            }
        }

        for requirement in requirements.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
            let spec = DependencySpec::parse_requirement(requirement)?;
            let normalized = spec.normalized_name();
            if seen.insert(normalized.clone()) {
                plan.entries.push(spec);
            } else if let Some(existing) = plan
                .entries
                .iter_mut()
                .find(|e| e.normalized_name() == normalized)
            {
                if spec.constraint.is_some() {
                    existing.constraint = spec.constraint;
                }
            }
        }

        debug!("Resolved install plan: {:?}", plan.packages());
        Ok(plan)
    }
}

/// Top-level module names imported by `code`, in order of appearance
fn scan_imports(code: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for caps in IMPORT_LINE.captures_iter(code) {
        let Some(list) = caps.get(1) else { continue };
        let list = list.as_str();
        let list = list.split(['#', ';']).next().unwrap_or("");
        for item in list.split(',') {
            let name = item.split_whitespace().next().unwrap_or("");
            let name = name.trim_matches(|c| c == '(' || c == ')' || c == '\\');
            if !name.is_empty() {
                found.push((caps.get(0).map_or(0, |m| m.start()), dotted_path(name)));
            }
        }
    }

    for caps in FROM_LINE.captures_iter(code) {
        let Some(module) = caps.get(1) else { continue };
        if module.as_str().starts_with('.') {
            continue;
        }
        found.push((module.start(), dotted_path(module.as_str())));
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, name)| name).collect()
}

fn dotted_path(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

fn is_stdlib(module: &str) -> bool {
    let top = module.split('.').next().unwrap_or(module);
    STDLIB_MODULES.contains(&top)
}

/// Map an import path to its distribution, preferring the longest table match
fn map_module(module: &str) -> DependencySpec {
    let top = module.split('.').next().unwrap_or(module).to_string();

    let qualified = MODULE_PACKAGES
        .iter()
        .filter(|(m, _)| module == *m || module.starts_with(&format!("{}.", m)))
        .max_by_key(|(m, _)| m.len());

    match qualified {
        Some((m, package)) => DependencySpec {
            module: Some(m.to_string()),
            package: package.to_string(),
            constraint: None,
            source: DependencySource::Lookup,
        },
        None => DependencySpec {
            module: Some(top.clone()),
            package: top,
            constraint: None,
            source: DependencySource::Heuristic,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn packages(plan: &InstallPlan) -> Vec<&str> {
        plan.entries.iter().map(|e| e.package.as_str()).collect()
    }

    #[test]
    fn test_numpy_and_requests() {
        let code = "import numpy as np\nimport requests\n\nprint(np.arange(3), requests.__version__)\n";
        let plan = DependencyResolver::default()
            .resolve(Language::Python, code, &[])
            .unwrap();
        assert_eq!(packages(&plan), vec!["numpy", "requests"]);
        assert!(plan
            .entries
            .iter()
            .all(|e| e.source == DependencySource::Heuristic));
    }

    #[test]
    fn test_lookup_table_stdlib_and_dedup() {
        let code = r#"
import os, sys
import cv2
from sklearn.model_selection import train_test_split
from PIL import Image
import yaml, numpy.linalg  # trailing comment
from . import sibling
from .local import helper
import numpy as np
from google.protobuf import message
"#;
        let plan = DependencyResolver::default()
            .resolve(Language::Python, code, &[])
            .unwrap();
        assert_eq!(
            packages(&plan),
            vec![
                "opencv-python-headless",
                "scikit-learn",
                "Pillow",
                "PyYAML",
                "numpy",
                "protobuf"
            ]
        );
        assert_eq!(plan.entries[0].source, DependencySource::Lookup);
        assert_eq!(plan.entries[0].module.as_deref(), Some("cv2"));
    }

    #[test]
    fn test_base_packages_are_filtered() {
        let resolver = DependencyResolver::new(["numpy", "setuptools"]);
        let plan = resolver
            .resolve(Language::Python, "import numpy\nimport setuptools\nimport pandas", &[])
            .unwrap();
        assert_eq!(packages(&plan), vec!["pandas"]);
    }

    #[test]
    fn test_explicit_requirements_append_and_pin() {
        let plan = DependencyResolver::default()
            .resolve(
                Language::Python,
                "import numpy\nimport requests",
                &["requests >= 2.31, <3".to_string(), "tabulate==0.9.0".to_string()],
            )
            .unwrap();
        assert_eq!(packages(&plan), vec!["numpy", "requests", "tabulate"]);
        assert_eq!(plan.entries[1].constraint.as_deref(), Some(">=2.31,<3"));
        assert_eq!(plan.entries[2].requirement(), "tabulate==0.9.0");
        assert_eq!(plan.entries[2].source, DependencySource::Explicit);
    }

    #[rstest]
    #[case("requests; rm -rf /")]
    #[case("--index-url=http://evil")]
    #[case("numpy==1.0 && curl x")]
    #[case("pkg==$(whoami)")]
    fn test_hostile_requirements_rejected(#[case] requirement: &str) {
        let result = DependencyResolver::default().resolve(
            Language::Python,
            "",
            &[requirement.to_string()],
        );
        assert!(matches!(result, Err(SandboxError::Configuration(_))));
    }

    #[test]
    fn test_non_python_has_empty_plan() {
        let plan = DependencyResolver::default()
            .resolve(
                Language::Javascript,
                "import fs from 'fs'",
                &["left-pad".to_string()],
            )
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_uninstallable_imports_stay_in_plan() {
        let plan = DependencyResolver::default()
            .resolve(Language::Python, "import _speedups\nimport requests", &[])
            .unwrap();
        assert_eq!(packages(&plan), vec!["_speedups", "requests"]);
        assert!(plan.entries[0].validate().is_err());
        assert_eq!(plan.entries[0].source, DependencySource::Heuristic);
    }

    #[test]
    fn test_unknown_modules_stay_in_plan() {
        let plan = DependencyResolver::default()
            .resolve(Language::Python, "import numpyy", &[])
            .unwrap();
        assert_eq!(packages(&plan), vec!["numpyy"]);
    }
}
