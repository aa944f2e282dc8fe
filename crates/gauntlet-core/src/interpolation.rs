//! `${{ ... }}` expression interpolation.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("expression pattern is valid")
});

static MATRIX_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*matrix\.([A-Za-z0-9_-]+)\s*\}\}").expect("matrix pattern is valid")
});

/// Context for variable interpolation within one job run.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Job-level environment variables.
    pub variables: HashMap<String, String>,
    /// Matrix values for the current job.
    pub matrix: HashMap<String, String>,
    /// Runner label the job was resolved to.
    pub runner_os: Option<String>,
    /// Triggering event fields (`ref`, `sha`, `kind`, ...).
    pub event: HashMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate variables in a string.
    ///
    /// Supports:
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ runner.os }}` - resolved runner label
    /// - `${{ event.key }}` - triggering event field
    /// - `${{ env.VAR }}` - job variable, then process environment
    ///
    /// Unknown expressions resolve to an empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        if expr == "runner.os" {
            return self.runner_os.clone().unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("event.") {
            return self.event.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }
}

/// Matrix axis names referenced by `${{ matrix.X }}` in a template.
pub fn matrix_references(input: &str) -> Vec<String> {
    MATRIX_REFERENCE
        .captures_iter(input)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_matrix_variable() {
        let mut ctx = InterpolationContext::new();
        ctx.matrix.insert("os".to_string(), "ubuntu-latest".to_string());
        ctx.matrix.insert("toolchain".to_string(), "stable".to_string());

        assert_eq!(
            ctx.interpolate("${{ matrix.os }}-cargo-${{matrix.toolchain}}"),
            "ubuntu-latest-cargo-stable"
        );
    }

    #[test]
    fn test_interpolate_runner_and_event() {
        let mut ctx = InterpolationContext::new();
        ctx.runner_os = Some("ubuntu-latest".to_string());
        ctx.event.insert("sha".to_string(), "abc123".to_string());

        assert_eq!(
            ctx.interpolate("${{ runner.os }} @ ${{ event.sha }}"),
            "ubuntu-latest @ abc123"
        );
    }

    #[test]
    fn test_interpolate_missing_returns_empty() {
        let ctx = InterpolationContext::new();
        assert_eq!(ctx.interpolate("v=${{ matrix.missing }}"), "v=");
        assert_eq!(ctx.interpolate("${{ event.ref }}"), "");
    }

    #[test]
    fn test_plain_text_untouched() {
        let ctx = InterpolationContext::new();
        assert_eq!(ctx.interpolate("cargo fmt -- --check"), "cargo fmt -- --check");
    }

    #[test]
    fn test_matrix_references() {
        assert_eq!(
            matrix_references("${{ matrix.os }}-x-${{ matrix.rust_version }} ${{ runner.os }}"),
            vec!["os".to_string(), "rust_version".to_string()]
        );
    }
}
