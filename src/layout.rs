//! The boundary contract: every type and symbol both sides must agree on.
//!
//! The contract is built from the compiled layout (`size_of`, `offset_of!`)
//! so the header and manifest always describe what the library really
//! exports.

use std::ffi::c_int;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::error::{InteropError, InteropResult, InteropStatus};
use crate::geometry::Point;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub name: String,
    pub c_type: String,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructLayout {
    /// C struct tag.
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    pub fn point() -> Self {
        Self {
            name: "point".to_string(),
            size: mem::size_of::<Point>(),
            align: mem::align_of::<Point>(),
            fields: vec![
                FieldLayout {
                    name: "x".to_string(),
                    c_type: "int".to_string(),
                    offset: mem::offset_of!(Point, x),
                    size: mem::size_of::<c_int>(),
                },
                FieldLayout {
                    name: "y".to_string(),
                    c_type: "int".to_string(),
                    offset: mem::offset_of!(Point, y),
                    size: mem::size_of::<c_int>(),
                },
            ],
        }
    }

    /// Checks that `foreign` describes the same layout as `self`.
    pub fn verify(&self, foreign: &StructLayout) -> InteropResult<()> {
        let mismatch = |detail: String| InteropError::LayoutMismatch {
            type_name: self.name.clone(),
            detail,
        };

        if foreign.size != self.size {
            return Err(mismatch(format!("size ({} vs {})", foreign.size, self.size)));
        }
        if foreign.align != self.align {
            return Err(mismatch(format!("alignment ({} vs {})", foreign.align, self.align)));
        }
        if foreign.fields.len() != self.fields.len() {
            return Err(mismatch(format!(
                "field count ({} vs {})",
                foreign.fields.len(),
                self.fields.len()
            )));
        }

        for (index, (theirs, ours)) in foreign.fields.iter().zip(&self.fields).enumerate() {
            if theirs.name != ours.name {
                return Err(mismatch(format!(
                    "field {index} name (`{}` vs `{}`)",
                    theirs.name, ours.name
                )));
            }
            if theirs.c_type != ours.c_type || theirs.size != ours.size {
                return Err(mismatch(format!(
                    "type of `{}` ({} [{} bytes] vs {} [{} bytes])",
                    ours.name, theirs.c_type, theirs.size, ours.c_type, ours.size
                )));
            }
            if theirs.offset != ours.offset {
                return Err(mismatch(format!(
                    "offset of `{}` ({} vs {})",
                    ours.name, theirs.offset, ours.offset
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub c_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    pub return_type: String,
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub doc: String,
}

impl FunctionSignature {
    fn new(name: &str, return_type: &str, params: &[(&str, &str)], doc: &str) -> Self {
        Self {
            name: name.to_string(),
            return_type: return_type.to_string(),
            params: params
                .iter()
                .map(|(name, c_type)| Param {
                    name: name.to_string(),
                    c_type: c_type.to_string(),
                })
                .collect(),
            doc: doc.to_string(),
        }
    }

    /// C prototype without the trailing semicolon.
    pub fn prototype(&self) -> String {
        let params = if self.params.is_empty() {
            "void".to_string()
        } else {
            self.params
                .iter()
                .map(|param| render_declarator(&param.c_type, &param.name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!("{}({params})", render_declarator(&self.return_type, &self.name))
    }
}

/// Places `name` inside a C type. Function pointer types carry a `(*)`
/// placeholder for the declarator.
fn render_declarator(c_type: &str, name: &str) -> String {
    if let Some((head, tail)) = c_type.split_once("(*)") {
        format!("{head}(*{name}){tail}")
    } else if c_type.ends_with('*') {
        format!("{c_type}{name}")
    } else {
        format!("{c_type} {name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constant {
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryContract {
    pub structs: Vec<StructLayout>,
    pub functions: Vec<FunctionSignature>,
    pub constants: Vec<Constant>,
}

impl BoundaryContract {
    /// The contract of this build.
    pub fn current() -> Self {
        let functions = vec![
            FunctionSignature::new(
                "dist",
                "double",
                &[("p1", "const struct point *"), ("p2", "const struct point *")],
                "Euclidean distance between two points; NaN if either is NULL.",
            ),
            FunctionSignature::new(
                "make_memory",
                "int *",
                &[],
                "Allocates an int on the C heap holding 2; release with free_memory. NULL on failure.",
            ),
            FunctionSignature::new(
                "make_boxed_memory",
                "int *",
                &[("value", "int")],
                "Allocates an int on the Rust heap; release with drop_pointer. NULL on failure.",
            ),
            FunctionSignature::new(
                "take_ownership",
                "int",
                &[("i", "int *"), ("dtor", "void (*)(int *)")],
                "Prints *i as \"got <value>\", then releases it through dtor. Returns FFIBRIDGE_OK or a negative status.",
            ),
            FunctionSignature::new(
                "free_memory",
                "void",
                &[("i", "int *")],
                "Destructor for cells from make_memory; ignores cells that are not live.",
            ),
            FunctionSignature::new(
                "drop_pointer",
                "void",
                &[("i", "int *")],
                "Destructor for cells from make_boxed_memory; ignores cells that are not live.",
            ),
            FunctionSignature::new(
                "ffibridge_status_message",
                "const char *",
                &[("code", "int")],
                "Static description of a status code.",
            ),
            FunctionSignature::new(
                "ffibridge_init_logging",
                "int",
                &[("verbose", "int")],
                "Installs a stderr log subscriber. Returns 0, or -1 if one is already installed.",
            ),
        ];

        let constants = InteropStatus::ALL
            .into_iter()
            .map(|status| Constant {
                name: status.name().to_string(),
                value: i64::from(status.code()),
            })
            .collect();

        Self {
            structs: vec![StructLayout::point()],
            functions,
            constants,
        }
    }

    pub fn find_struct(&self, name: &str) -> Option<&StructLayout> {
        self.structs.iter().find(|layout| layout.name == name)
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.iter().find(|function| function.name == name)
    }

    /// Checks a contract produced elsewhere (usually read back from a
    /// manifest) against this one.
    pub fn verify(&self, foreign: &BoundaryContract) -> InteropResult<()> {
        for ours in &self.structs {
            let theirs = foreign.find_struct(&ours.name).ok_or_else(|| InteropError::LayoutMismatch {
                type_name: ours.name.clone(),
                detail: "presence (missing from the foreign contract)".to_string(),
            })?;
            ours.verify(theirs)?;
        }

        for ours in &self.functions {
            match foreign.find_function(&ours.name) {
                Some(theirs) if theirs.return_type == ours.return_type && theirs.params == ours.params => {}
                Some(theirs) => {
                    return Err(InteropError::LayoutMismatch {
                        type_name: ours.name.clone(),
                        detail: format!("signature (`{}` vs `{}`)", theirs.prototype(), ours.prototype()),
                    });
                }
                None => {
                    return Err(InteropError::LayoutMismatch {
                        type_name: ours.name.clone(),
                        detail: "presence (missing from the foreign contract)".to_string(),
                    });
                }
            }
        }

        for ours in &self.constants {
            let found = foreign.constants.iter().find(|constant| constant.name == ours.name);
            if found.map(|constant| constant.value) != Some(ours.value) {
                return Err(InteropError::LayoutMismatch {
                    type_name: ours.name.clone(),
                    detail: format!("value (expected {})", ours.value),
                });
            }
        }

        Ok(())
    }
}
