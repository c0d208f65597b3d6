//! Variant expression evaluation: turns a small user-supplied expression
//! into the string discriminator that partitions the dependency store.
//!
//! The original `pytest-testmon` hands the expression to Python's `eval`
//! with a handful of globals (`os`, `sys`, `hashlib`). Embedding a real
//! interpreter for three capabilities would grant far more than the spec
//! allows (filesystem writes, subprocess spawn, arbitrary imports), so this
//! is a small hand-rolled parser over a restricted grammar instead:
//!
//! ```text
//! expr  := term (" + " term)*
//! term  := string | call
//! call  := ident "(" [expr ("," expr)*] ")"
//! ident := env_get | md5 | sys_prefix | sys_platform
//! ```
//!
//! `env_get("NAME")` reads an environment variable (empty string if unset).
//! `md5("text")` hashes to a lowercase hex digest. `sys_prefix()` and
//! `sys_platform()` answer the two process-info queries the spec allows.

use md5::{Digest, Md5};
use std::collections::HashMap;

struct VariantEvalError(String);

/// Evaluate `expression` against `env`. Never panics or propagates an
/// error: any failure (unknown identifier, malformed call, unterminated
/// string) is caught and its message becomes the returned variant string,
/// per §4.6 — a broken expression is loud, not fatal.
pub fn eval_variant(expression: &str, env: &HashMap<String, String>) -> String {
    if expression.trim().is_empty() {
        return String::new();
    }
    match Parser::new(expression, env).parse() {
        Ok(value) => value,
        Err(e) => e.0,
    }
}

/// Build the environment map the evaluator consults: real process
/// environment variables plus the two fixed process-info queries.
pub fn eval_variant_with_os_env(expression: &str) -> String {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.insert(
        "__sys_prefix".to_string(),
        std::env::var("VIRTUAL_ENV").unwrap_or_else(|_| "/usr".to_string()),
    );
    env.insert("__sys_platform".to_string(), std::env::consts::OS.to_string());
    eval_variant(expression, &env)
}

struct Parser<'a> {
    env: &'a HashMap<String, String>,
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, env: &'a HashMap<String, String>) -> Self {
        Self { env, src, pos: 0 }
    }

    fn parse(&mut self) -> Result<String, VariantEvalError> {
        let mut out = String::new();
        loop {
            self.skip_ws();
            out.push_str(&self.parse_term()?);
            self.skip_ws();
            if self.peek_str("+") {
                self.advance_by(1);
                continue;
            }
            break;
        }
        self.skip_ws();
        if self.pos < self.src.len() {
            return Err(VariantEvalError(format!(
                "unexpected trailing input at byte {}",
                self.pos
            )));
        }
        Ok(out)
    }

    fn parse_term(&mut self) -> Result<String, VariantEvalError> {
        self.skip_ws();
        match self.current_char() {
            Some('"') | Some('\'') => self.parse_string(),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_call(),
            other => Err(VariantEvalError(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_string(&mut self) -> Result<String, VariantEvalError> {
        let quote = self.current_char().unwrap();
        self.advance_by(quote.len_utf8());
        let start = self.pos;
        loop {
            match self.current_char() {
                Some(c) if c == quote => {
                    let literal = self.src[start..self.pos].to_string();
                    self.advance_by(quote.len_utf8());
                    return Ok(literal);
                }
                Some(c) => self.advance_by(c.len_utf8()),
                None => return Err(VariantEvalError("unterminated string literal".to_string())),
            }
        }
    }

    fn parse_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.current_char() {
            if c.is_alphanumeric() || c == '_' {
                self.advance_by(c.len_utf8());
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn parse_call(&mut self) -> Result<String, VariantEvalError> {
        let ident = self.parse_ident();
        self.skip_ws();

        if !self.peek_str("(") {
            return self.dispatch(&ident, Vec::new());
        }
        self.advance_by(1);
        let mut args = Vec::new();
        self.skip_ws();
        if !self.peek_str(")") {
            loop {
                args.push(self.parse_term()?);
                self.skip_ws();
                if self.peek_str(",") {
                    self.advance_by(1);
                    self.skip_ws();
                    continue;
                }
                break;
            }
        }
        self.skip_ws();
        if !self.peek_str(")") {
            return Err(VariantEvalError(format!("expected ')' after {ident}(...")));
        }
        self.advance_by(1);
        self.dispatch(&ident, args)
    }

    fn dispatch(&self, ident: &str, args: Vec<String>) -> Result<String, VariantEvalError> {
        match ident {
            "env_get" => {
                let name = args
                    .first()
                    .ok_or_else(|| VariantEvalError("env_get requires one argument".to_string()))?;
                Ok(self.env.get(name).cloned().unwrap_or_default())
            }
            "md5" => {
                let text = args
                    .first()
                    .ok_or_else(|| VariantEvalError("md5 requires one argument".to_string()))?;
                let mut hasher = Md5::new();
                hasher.update(text.as_bytes());
                Ok(format!("{:x}", hasher.finalize()))
            }
            "sys_prefix" => Ok(self.env.get("__sys_prefix").cloned().unwrap_or_default()),
            "sys_platform" => Ok(self
                .env
                .get("__sys_platform")
                .cloned()
                .unwrap_or_else(|| std::env::consts::OS.to_string())),
            other => Err(VariantEvalError(format!("unknown identifier '{other}'"))),
        }
    }

    fn current_char(&mut self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn advance_by(&mut self, bytes: usize) {
        self.pos += bytes;
    }

    fn peek_str(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.current_char() {
            if c.is_whitespace() {
                self.advance_by(c.len_utf8());
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_expression_yields_empty_string() {
        assert_eq!(eval_variant("", &HashMap::new()), "");
    }

    #[test]
    fn env_get_reads_from_env_map() {
        let mut env = HashMap::new();
        env.insert("TEST_V".to_string(), "A".to_string());
        assert_eq!(eval_variant("env_get(\"TEST_V\")", &env), "A");
    }

    #[test]
    fn env_get_missing_var_is_empty_string() {
        assert_eq!(eval_variant("env_get(\"NOPE\")", &HashMap::new()), "");
    }

    #[test]
    fn md5_hashes_deterministically() {
        let a = eval_variant("md5(\"hello\")", &HashMap::new());
        let b = eval_variant("md5(\"hello\")", &HashMap::new());
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn unknown_identifier_is_caught_not_propagated() {
        let result = eval_variant("rm_rf(\"/\")", &HashMap::new());
        assert!(result.contains("unknown identifier"));
    }

    #[test]
    fn unterminated_string_is_caught() {
        let result = eval_variant("env_get(\"oops", &HashMap::new());
        assert!(result.contains("unterminated"));
    }

    #[test]
    fn concatenation_of_literals_and_calls() {
        let mut env = HashMap::new();
        env.insert("TEST_V".to_string(), "B".to_string());
        let result = eval_variant("\"v-\" + env_get(\"TEST_V\")", &env);
        assert_eq!(result, "v-B");
    }

    #[test]
    fn switching_variants_recovers_original_value() {
        let mut env_a = HashMap::new();
        env_a.insert("TEST_V".to_string(), "A".to_string());
        let mut env_b = HashMap::new();
        env_b.insert("TEST_V".to_string(), "B".to_string());

        let a1 = eval_variant("env_get(\"TEST_V\")", &env_a);
        let _b = eval_variant("env_get(\"TEST_V\")", &env_b);
        let a2 = eval_variant("env_get(\"TEST_V\")", &env_a);
        assert_eq!(a1, a2);
    }
}
