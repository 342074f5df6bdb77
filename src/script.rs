//! Rhai scripting step
//!
//! Provides a sandboxed scripting environment for transforms that do not
//! warrant an external program. A script sees `content`, `path` and
//! `compressed`; it may assign to `content` or evaluate to a string.

use std::path::Path;

use futures::future::BoxFuture;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};

use crate::pipeline::{Artifact, Mode, Step, StepError};

/// Pipeline step running a compiled Rhai script per artifact
#[derive(Debug, Clone)]
pub struct ScriptStep {
    ast: AST,
    compressed: bool,
}

impl ScriptStep {
    /// Compile a script for repeated execution
    pub fn compile(source: &str, mode: Mode) -> Result<Self, String> {
        let engine = create_engine();
        let ast = engine.compile(source).map_err(|e| e.to_string())?;
        Ok(Self {
            ast,
            compressed: mode.is_compressed(),
        })
    }

    /// Run the script against one artifact's contents
    pub fn transform(&self, content: &str, path: &Path) -> Result<String, Box<EvalAltResult>> {
        let mut scope = Scope::new();
        scope.push("content", content.to_string());
        scope.push("path", path.to_string_lossy().to_string());
        scope.push_constant("compressed", self.compressed);

        let engine = create_engine();
        let result: Dynamic = engine.eval_ast_with_scope(&mut scope, &self.ast)?;

        if let Some(s) = result.try_cast::<String>() {
            return Ok(s);
        }

        Ok(scope
            .get_value::<String>("content")
            .unwrap_or_else(|| content.to_string()))
    }
}

impl Step for ScriptStep {
    fn name(&self) -> &str {
        "script"
    }

    fn apply<'a>(
        &'a self,
        input: Vec<Artifact>,
    ) -> BoxFuture<'a, std::result::Result<Vec<Artifact>, StepError>> {
        Box::pin(async move {
            let mut output = Vec::with_capacity(input.len());
            for artifact in input {
                let next = self
                    .transform(&artifact.contents, artifact.origin())
                    .map_err(|e| StepError::Script {
                        path: artifact.origin().to_path_buf(),
                        message: e.to_string(),
                    })?;
                output.push(artifact.with_contents(next));
            }
            Ok(output)
        })
    }
}

/// Create a configured engine instance
fn create_engine() -> Engine {
    let mut engine = Engine::new();

    // Configure sandboxing
    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(1_000_000);
    engine.set_max_modules(10);
    engine.set_max_string_size(16 * 1024 * 1024); // 16MB

    engine.on_print(|s| tracing::info!(target: "assetflow::script", "{}", s));
    engine.on_debug(|s, _, pos| tracing::debug!(target: "assetflow::script", "{:?} {}", pos, s));

    register_stdlib(&mut engine);

    engine
}

/// Register the path and JSON helpers scripts may call
fn register_stdlib(engine: &mut Engine) {
    engine.register_fn("file_name", |path: &str| -> String {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    engine.register_fn("extension", |path: &str| -> String {
        Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    // JSON goes through rhai's serde bridge
    engine.register_fn("parse_json", |s: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(|e| format!("Failed to parse JSON: {}", e))?;
        rhai::serde::to_dynamic(value)
    });

    engine.register_fn("to_json", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
        serde_json::to_string(&json).map_err(|e| format!("Failed to serialize JSON: {}", e).into())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_returns_string() {
        let step = ScriptStep::compile(r#"content.to_upper()"#, Mode::Compressed).unwrap();
        let out = step.transform("body{}", Path::new("a.css")).unwrap();
        assert_eq!(out, "BODY{}");
    }

    #[test]
    fn test_script_assigns_content() {
        let step = ScriptStep::compile(
            r#"
                if compressed {
                    content.replace("\n", "");
                }
                content = "/* " + file_name(path) + " */" + content;
            "#,
            Mode::Compressed,
        )
        .unwrap();
        let out = step.transform("a{}\nb{}", Path::new("src/site.css")).unwrap();
        assert_eq!(out, "/* site.css */a{}b{}");
    }

    #[test]
    fn test_uncompressed_flag_visible() {
        let step = ScriptStep::compile(
            r#"if compressed { "min" } else { "full" }"#,
            Mode::Uncompressed,
        )
        .unwrap();
        assert_eq!(step.transform("", Path::new("x")).unwrap(), "full");
    }

    #[test]
    fn test_compile_error() {
        assert!(ScriptStep::compile("let = ;", Mode::Compressed).is_err());
    }

    #[test]
    fn test_json_helpers() {
        let step = ScriptStep::compile(
            r#"let m = parse_json(content); m.name = "site"; to_json(m)"#,
            Mode::Compressed,
        )
        .unwrap();
        let out = step.transform(r#"{"name":"x"}"#, Path::new("m.json")).unwrap();
        assert_eq!(out, r#"{"name":"site"}"#);
    }

    #[test]
    fn test_json_keeps_nested_values() {
        let step = ScriptStep::compile(
            r#"let m = parse_json(content); m.tags.push("b"); m.draft = false; to_json(m)"#,
            Mode::Compressed,
        )
        .unwrap();
        let out = step
            .transform(r#"{"draft":true,"size":3,"tags":["a"]}"#, Path::new("m.json"))
            .unwrap();
        assert_eq!(out, r#"{"draft":false,"size":3,"tags":["a","b"]}"#);
    }

    #[test]
    fn test_invalid_json_is_a_script_error() {
        let step = ScriptStep::compile(r#"parse_json(content)"#, Mode::Compressed).unwrap();
        let err = step.transform("{oops", Path::new("m.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }

    #[test]
    fn test_extension_helper() {
        let step = ScriptStep::compile(
            r#"if extension(path) == "css" { content + "/* css */" } else { content }"#,
            Mode::Compressed,
        )
        .unwrap();
        assert_eq!(step.transform("a{}", Path::new("src/site.css")).unwrap(), "a{}/* css */");
        assert_eq!(step.transform("x()", Path::new("src/main.js")).unwrap(), "x()");
        assert_eq!(step.transform("x", Path::new("LICENSE")).unwrap(), "x");
    }

    #[tokio::test]
    async fn test_script_step_applies_to_artifacts() {
        let step = ScriptStep::compile(r#"content + ";""#, Mode::Compressed).unwrap();
        let out = step.apply(vec![Artifact::new("a.js", "x()")]).await.unwrap();
        assert_eq!(out[0].contents, "x();");
    }
}
