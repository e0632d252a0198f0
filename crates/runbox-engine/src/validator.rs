//! Pre-execution security validator.
//!
//! The V8 isolate is the real security boundary. These checks reject the
//! obvious escape attempts before any admission slot or runtime is spent on
//! them, and give callers a precise error instead of an opaque runtime
//! failure.
//!
//! All patterns are matched against [`lexer::strip`]ped code, so text inside
//! string literals and comments never triggers a rejection.

use std::sync::LazyLock;

use base64::Engine as _;
use regex::Regex;

use crate::error::ExecutionError;
use crate::lexer;

/// Maximum bracket nesting depth. Deeper input risks overflowing the
/// parser's stack.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Default maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_LENGTH: usize = 64 * 1024;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex is valid")
}

/// Identifiers and access patterns banned from sandbox code, with the name
/// reported to the caller.
static BANNED_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("eval(", re(r"\beval\s*\(")),
        ("Function(", re(r"\bFunction\s*\(")),
        ("__proto__", re(r"__proto__")),
        ("constructor[", re(r"\bconstructor\s*\[")),
        ("constructor.constructor", re(r"\bconstructor\s*\.\s*constructor\b")),
        ("Reflect.", re(r"\bReflect\s*\.")),
        ("globalThis[", re(r"\bglobalThis\s*\[")),
        ("String.fromCharCode", re(r"\bString\s*\.\s*fromCharCode\b")),
        ("Deno.", re(r"\bDeno\s*\.")),
        ("WebAssembly", re(r"\bWebAssembly\b")),
        // Specific process.* members, not bare "process." (data.process.status is fine)
        (
            "process.",
            re(r"\bprocess\s*\.\s*(env|exit|argv|stdin|stdout|stderr|kill|binding|mainModule)\b"),
        ),
        ("__defineGetter__", re(r"__(define|lookup)(Getter|Setter)__")),
        ("__runbox", re(r"(^|[^\w$])__runbox\b")),
    ]
});

static IMPORT_META_RE: LazyLock<Regex> = LazyLock::new(|| re(r"\bimport\s*\.\s*meta\b"));

static STATIC_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^\s*import\b(\s+([\w{*$;]|$)|\s*[{*])"));

static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^\s*export\b\s*[\w{*]"));

static MODULE_LOAD_RE: LazyLock<Regex> = LazyLock::new(|| re(r"\b(require|import)\s*\("));

static INFINITE_LOOP_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        re(r"\bwhile\s*\(\s*(true|1|!0)\s*\)"),
        re(r"\bfor\s*\(\s*;\s*;\s*\)"),
    ]
});

/// Rejects disallowed code before any execution resource is committed.
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    max_code_length: usize,
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CODE_LENGTH)
    }
}

impl SecurityValidator {
    /// Create a validator with the given maximum code length in bytes.
    pub fn new(max_code_length: usize) -> Self {
        Self { max_code_length }
    }

    /// Configured maximum code length in bytes.
    pub fn max_code_length(&self) -> usize {
        self.max_code_length
    }

    /// Validate raw source code.
    pub fn validate(&self, code: &str) -> Result<(), ExecutionError> {
        // 1. Empty code
        if code.trim().is_empty() {
            return Err(ExecutionError::ValidationFailed {
                reason: "code is empty".into(),
            });
        }

        // 2. Size limit
        if code.len() > self.max_code_length {
            return Err(ExecutionError::CodeTooLarge {
                max: self.max_code_length,
                actual: code.len(),
            });
        }

        let stripped = lexer::strip(code);

        // 3. Nesting depth, before anything hands the code to a parser
        check_nesting_depth(&stripped)?;

        // 4. Module syntax
        if IMPORT_META_RE.is_match(&stripped) {
            return Err(ExecutionError::SyntaxNotSupported {
                construct: "import.meta".into(),
            });
        }
        if STATIC_IMPORT_RE.is_match(&stripped) {
            return Err(ExecutionError::SyntaxNotSupported {
                construct: "import declaration".into(),
            });
        }
        if EXPORT_RE.is_match(&stripped) {
            return Err(ExecutionError::SyntaxNotSupported {
                construct: "export declaration".into(),
            });
        }

        // 5. Module loading
        if let Some(caps) = MODULE_LOAD_RE.captures(&stripped) {
            let loader = caps.get(1).map(|m| m.as_str()).unwrap_or("require");
            let call_end = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let module = module_name_at(code, call_end).unwrap_or_else(|| format!("{loader}("));
            return Err(ExecutionError::BannedModule { module });
        }

        // 6. Banned identifiers
        for (name, pattern) in BANNED_PATTERNS.iter() {
            if pattern.is_match(&stripped) {
                return Err(ExecutionError::BannedPattern {
                    pattern: (*name).to_string(),
                });
            }
        }

        // 7. Literal infinite loops
        for pattern in INFINITE_LOOP_RES.iter() {
            if let Some(m) = pattern.find(&stripped) {
                return Err(ExecutionError::InfiniteLoop {
                    pattern: m.as_str().split_whitespace().collect(),
                });
            }
        }

        Ok(())
    }

    /// Decode base64 transport code, checking the size before decoding.
    pub fn decode(&self, encoded: &str) -> Result<String, ExecutionError> {
        let encoded = encoded.trim();
        let max_encoded = self.max_code_length.div_ceil(3) * 4;
        if encoded.len() > max_encoded {
            return Err(ExecutionError::CodeTooLarge {
                max: self.max_code_length,
                actual: encoded.len() / 4 * 3,
            });
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ExecutionError::InvalidEncoding {
                reason: e.to_string(),
            })?;
        String::from_utf8(bytes).map_err(|e| ExecutionError::InvalidEncoding {
            reason: format!("code is not UTF-8: {e}"),
        })
    }
}

/// Check bracket nesting depth of (stripped) code.
fn check_nesting_depth(code: &str) -> Result<(), ExecutionError> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for b in code.bytes() {
        match b {
            b'{' | b'[' | b'(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' | b']' | b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(ExecutionError::ValidationFailed {
            reason: format!("nesting depth {max_depth} exceeds maximum {MAX_NESTING_DEPTH}"),
        });
    }
    Ok(())
}

/// Read a quoted module specifier starting at `offset` in the raw source.
fn module_name_at(code: &str, offset: usize) -> Option<String> {
    let rest = code.get(offset..)?.trim_start();
    let quote = rest.chars().next().filter(|c| matches!(c, '\'' | '"' | '`'))?;
    let body = &rest[1..];
    let end = body.find(quote)?;
    Some(body[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn validate(code: &str) -> Result<(), ExecutionError> {
        SecurityValidator::default().validate(code)
    }

    #[test]
    fn accepts_plain_code() {
        assert!(validate("return input.a + input.b;").is_ok());
        assert!(validate("const xs = [1, 2, 3]; return xs.map(x => x * 2);").is_ok());
    }

    #[test]
    fn rejects_empty_code() {
        assert!(matches!(
            validate("   \n"),
            Err(ExecutionError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn rejects_oversized_code() {
        let v = SecurityValidator::new(50);
        let err = v.validate(&"x".repeat(100)).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::CodeTooLarge {
                max: 50,
                actual: 100
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn rejects_deep_nesting() {
        let code = format!("return {}1{};", "(".repeat(300), ")".repeat(300));
        let err = validate(&code).unwrap_err();
        assert!(err.to_string().contains("nesting depth"), "got: {err}");
    }

    #[test]
    fn brackets_in_strings_do_not_count_toward_nesting() {
        let code = format!("return \"{}\";", "(".repeat(300));
        assert!(validate(&code).is_ok());
    }

    #[test]
    fn rejects_module_syntax() {
        for code in [
            "import fs from 'fs';\nreturn 1;",
            "import { a } from \"b\";",
            "import * as x from 'y'",
            "import 'side-effect';",
            "export const a = 1;",
            "export default 1;",
            "return import.meta.url;",
        ] {
            let err = validate(code).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SyntaxNotSupported, "code: {code}");
        }
    }

    #[test]
    fn exports_identifier_is_allowed() {
        assert!(validate("const exports = {}; exports.a = 1; return exports;").is_ok());
    }

    #[test]
    fn rejects_module_loading_with_name() {
        let err = validate("const fs = require('fs'); return 1;").unwrap_err();
        assert!(matches!(&err, ExecutionError::BannedModule { module } if module == "fs"));
        assert_eq!(err.kind(), ErrorKind::Security);

        let err = validate("return await import(\"child_process\");").unwrap_err();
        assert!(
            matches!(&err, ExecutionError::BannedModule { module } if module == "child_process")
        );

        let err = validate("const m = 'x'; return require(m);").unwrap_err();
        assert!(matches!(&err, ExecutionError::BannedModule { module } if module == "require("));
    }

    #[test]
    fn rejects_banned_patterns() {
        for (code, pattern) in [
            ("return eval('1+1');", "eval("),
            ("return new Function('return this')();", "Function("),
            ("({}).__proto__.x = 1;", "__proto__"),
            ("return ''.constructor.constructor('x')();", "constructor.constructor"),
            ("return x.constructor['name'];", "constructor["),
            ("return Reflect.ownKeys(x);", "Reflect."),
            ("return globalThis['ev' + 'al'];", "globalThis["),
            ("return String.fromCharCode(101);", "String.fromCharCode"),
            ("return Deno.readFile('/etc/passwd');", "Deno."),
            ("return WebAssembly;", "WebAssembly"),
            ("return process.env.SECRET;", "process."),
            ("o.__defineGetter__('x', f);", "__defineGetter__"),
            ("return __runbox;", "__runbox"),
        ] {
            match validate(code) {
                Err(ExecutionError::BannedPattern { pattern: p }) => {
                    assert_eq!(p, pattern, "code: {code}")
                }
                other => panic!("expected BannedPattern for {code}, got {other:?}"),
            }
        }
    }

    #[test]
    fn banned_words_in_strings_and_comments_are_allowed() {
        let code = r#"// eval( is dangerous
const msg = "never call eval() or require('fs')";
/* while(true) */
return msg;"#;
        assert!(validate(code).is_ok());
    }

    #[test]
    fn accepts_data_process_status() {
        assert!(validate("return data.process.status;").is_ok());
    }

    #[test]
    fn accepts_legitimate_constructor_property() {
        assert!(validate("return obj.constructor.name;").is_ok());
    }

    #[test]
    fn rejects_literal_infinite_loops() {
        for code in ["while(true){}", "while (1) { x++ }", "while(!0);", "for(;;){}", "for ( ; ; ) {}"] {
            let err = validate(code).unwrap_err();
            assert!(
                matches!(err, ExecutionError::InfiniteLoop { .. }),
                "code: {code}, got {err:?}"
            );
            assert_eq!(err.kind(), ErrorKind::Security);
        }
    }

    #[test]
    fn accepts_bounded_loops() {
        assert!(validate("let i = 0; while (i < 10) { i++; } return i;").is_ok());
        assert!(validate("let s = 0; for (let i = 0; i < 3; i++) s += i; return s;").is_ok());
    }

    #[test]
    fn decode_round_trips_utf8() {
        let v = SecurityValidator::default();
        let encoded = base64::engine::general_purpose::STANDARD.encode("return 'héllo';");
        assert_eq!(v.decode(&encoded).unwrap(), "return 'héllo';");
    }

    #[test]
    fn decode_checks_size_before_decoding() {
        let v = SecurityValidator::new(10);
        // Not valid base64 at all, but too long to even try.
        let err = v.decode(&"!".repeat(100)).unwrap_err();
        assert!(matches!(err, ExecutionError::CodeTooLarge { max: 10, .. }));
    }

    #[test]
    fn decode_rejects_malformed_input() {
        let v = SecurityValidator::default();
        let err = v.decode("not base64!!").unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidEncoding { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
