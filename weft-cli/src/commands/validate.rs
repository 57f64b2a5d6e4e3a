//! Validate command — static import/export audit of a guest binary.

use anyhow::{bail, Context, Result};
use wasmtime::{Engine, ExternType, Module, ValType};

/// Imports the host provides under `http_handler`.
const KNOWN_IMPORTS: &[&str] = &[
    "enable_features",
    "get_config",
    "get_method",
    "get_uri",
    "set_uri",
    "get_protocol_version",
    "get_status_code",
    "set_status_code",
    "get_header_names",
    "get_header_values",
    "set_header_value",
    "read_body",
    "write_body",
    "log",
    "log_enabled",
];

pub fn run(guest: &str) -> Result<()> {
    let bytes = std::fs::read(guest).with_context(|| format!("failed to read {guest}"))?;
    let engine = Engine::default();
    let module = Module::new(&engine, &bytes).context("guest does not compile")?;

    let report = audit(&module);

    println!("Guest: {guest}");
    println!("  exports: {}", module.exports().len());
    println!("  imports: {}", module.imports().len());
    for note in &report.notes {
        println!("  note: {note}");
    }
    for error in &report.errors {
        println!("  error: {error}");
    }

    if report.errors.is_empty() {
        println!("Guest is a valid http_handler middleware");
        Ok(())
    } else {
        bail!("validation failed with {} error(s)", report.errors.len())
    }
}

#[derive(Default)]
struct AuditReport {
    notes: Vec<String>,
    errors: Vec<String>,
}

fn audit(module: &Module) -> AuditReport {
    let mut report = AuditReport::default();

    if module
        .get_export("memory")
        .map_or(true, |ty| !matches!(ty, ExternType::Memory(_)))
    {
        report.errors.push("missing required export 'memory'".to_string());
    }

    match module.get_export("handle_request") {
        Some(ty) if func_matches(&ty, &[], &[ValType::I64]) => {}
        Some(_) => report
            .errors
            .push("'handle_request' has the wrong signature (want () -> i64)".to_string()),
        None => report
            .errors
            .push("missing required export 'handle_request'".to_string()),
    }

    match module.get_export("handle_response") {
        Some(ty) if func_matches(&ty, &[ValType::I32, ValType::I32], &[]) => {}
        Some(_) => report
            .errors
            .push("'handle_response' has the wrong signature (want (i32, i32) -> ())".to_string()),
        None => report
            .errors
            .push("missing required export 'handle_response'".to_string()),
    }

    match (
        module.get_export("_start").is_some(),
        module.get_export("_initialize").is_some(),
    ) {
        (true, true) => report
            .notes
            .push("both '_start' and '_initialize' exported; '_start' wins".to_string()),
        (true, false) => report.notes.push("init entry point: '_start'".to_string()),
        (false, true) => report
            .notes
            .push("init entry point: '_initialize'".to_string()),
        (false, false) => {}
    }

    for import in module.imports() {
        match import.module() {
            "http_handler" => {
                if !KNOWN_IMPORTS.contains(&import.name()) {
                    report.errors.push(format!(
                        "unknown http_handler import '{}'",
                        import.name()
                    ));
                }
            }
            "wasi_snapshot_preview1" => {}
            other => report
                .notes
                .push(format!("import from module '{other}' will not be provided")),
        }
    }

    report
}

fn func_matches(ty: &ExternType, params: &[ValType], results: &[ValType]) -> bool {
    fn val_types_eq(mut a: impl Iterator<Item = ValType>, b: &[ValType]) -> bool {
        let mut b = b.iter();
        loop {
            match (a.next(), b.next()) {
                (Some(a), Some(b)) if ValType::eq(&a, b) => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    match ty {
        ExternType::Func(func) => {
            val_types_eq(func.params(), params) && val_types_eq(func.results(), results)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(wat: &str) -> Module {
        let engine = Engine::default();
        Module::new(&engine, wat::parse_str(wat).unwrap()).unwrap()
    }

    #[test]
    fn valid_guest_passes_audit() {
        let module = module(
            r#"
            (module
                (import "http_handler" "enable_features"
                    (func (param i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "_initialize"))
                (func (export "handle_request") (result i64) (i64.const 1))
                (func (export "handle_response") (param i32 i32)))
        "#,
        );
        let report = audit(&module);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.notes.len(), 1);
    }

    #[test]
    fn missing_exports_are_reported() {
        let module = module(r#"(module (memory (export "memory") 1))"#);
        let report = audit(&module);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn wrong_signature_is_reported() {
        let module = module(
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "handle_request") (result i32) (i32.const 1))
                (func (export "handle_response") (param i32 i32)))
        "#,
        );
        let report = audit(&module);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("wrong signature")));
    }

    #[test]
    fn unknown_http_handler_import_is_an_error() {
        let module = module(
            r#"
            (module
                (import "http_handler" "not_a_thing" (func))
                (memory (export "memory") 1)
                (func (export "handle_request") (result i64) (i64.const 1))
                (func (export "handle_response") (param i32 i32)))
        "#,
        );
        let report = audit(&module);
        assert!(report.errors.iter().any(|e| e.contains("not_a_thing")));
    }
}
