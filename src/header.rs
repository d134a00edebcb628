use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::layout::BoundaryContract;

#[derive(Debug, Clone)]
pub struct GeneratedHeader {
    pub crate_name: String,
    pub header_path: PathBuf,
}

/// Renders the boundary contract as a C header.
pub struct HeaderGenerator {
    crate_name: String,
}

impl HeaderGenerator {
    pub fn new(crate_name: impl Into<String>) -> Self {
        Self {
            crate_name: crate_name.into(),
        }
    }

    fn include_guard(&self) -> String {
        let ident: String = self
            .crate_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{ident}_H")
    }

    pub fn render(&self, contract: &BoundaryContract) -> String {
        let guard = self.include_guard();
        let mut out = String::new();

        // writes into a String cannot fail
        let _ = writeln!(out, "/* Generated by {} {}. Do not edit. */", self.crate_name, env!("CARGO_PKG_VERSION"));
        let _ = writeln!(out, "#ifndef {guard}");
        let _ = writeln!(out, "#define {guard}");
        out.push('\n');
        out.push_str("#include <stddef.h>\n\n");
        out.push_str("#ifdef __cplusplus\nextern \"C\" {\n#endif\n\n");

        for constant in &contract.constants {
            let _ = writeln!(out, "#define {} ({})", constant.name, constant.value);
        }
        if !contract.constants.is_empty() {
            out.push('\n');
        }

        for layout in &contract.structs {
            let _ = writeln!(out, "struct {} {{", layout.name);
            for field in &layout.fields {
                let _ = writeln!(out, "    {} {};", field.c_type, field.name);
            }
            out.push_str("};\n\n");

            let _ = writeln!(
                out,
                "_Static_assert(sizeof(struct {0}) == {1}, \"struct {0} must be {1} bytes\");",
                layout.name, layout.size
            );
            let _ = writeln!(
                out,
                "_Static_assert(_Alignof(struct {0}) == {1}, \"struct {0} must be {1}-byte aligned\");",
                layout.name, layout.align
            );
            for field in &layout.fields {
                let _ = writeln!(
                    out,
                    "_Static_assert(offsetof(struct {0}, {1}) == {2}, \"{0}.{1} must be at offset {2}\");",
                    layout.name, field.name, field.offset
                );
            }
            out.push('\n');
        }

        for function in &contract.functions {
            if !function.doc.is_empty() {
                let _ = writeln!(out, "/* {} */", function.doc);
            }
            let _ = writeln!(out, "{};", function.prototype());
            out.push('\n');
        }

        out.push_str("#ifdef __cplusplus\n}\n#endif\n\n");
        let _ = writeln!(out, "#endif /* {guard} */");
        out
    }

    pub fn write_header(&self, contract: &BoundaryContract, header_path: &Path) -> Result<GeneratedHeader> {
        if let Some(parent) = header_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create header directory: {}", parent.display()))?;
        }

        fs::write(header_path, self.render(contract))
            .with_context(|| format!("Failed to write header to {}", header_path.display()))?;

        tracing::info!(path = %header_path.display(), "generated header");

        Ok(GeneratedHeader {
            crate_name: self.crate_name.clone(),
            header_path: header_path.to_path_buf(),
        })
    }
}
