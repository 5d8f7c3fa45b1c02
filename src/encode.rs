//! Renders a [Module] as LLVM assembly text.
//!
//! Pointers are written as opaque `ptr`, every named struct gets a type
//! definition up front, and globals follow in creation order. Globals
//! without a value are emitted as external declarations.

use std::fmt::Write;

use itertools::Itertools;
use smallstr::SmallString;

use crate::{
    helper::interner::{IStr, SpurHelper},
    llvm::{LLVMConst, LLVMPrimitive, LLVMType, LoweredTypeID, Module},
};

type Ident = SmallString<[u8; 32]>;

/// `@name` / `%name`, quoted when the name has characters LLVM does not
/// accept bare
fn ident(sigil: char, name: IStr) -> Ident {
    let text = name.resolve();
    let bare = !text.is_empty()
        && !text.starts_with(|c: char| c.is_ascii_digit())
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$' | '-'));

    let mut out = Ident::new();
    out.push(sigil);
    if bare {
        out.push_str(text);
    } else {
        out.push('"');
        out.push_str(&escape(text.as_bytes()));
        out.push('"');
    }
    out
}

fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for b in bytes {
        if b.is_ascii_graphic() && *b != b'"' && *b != b'\\' || *b == b' ' {
            out.push(*b as char);
        } else {
            let _ = write!(out, "\\{b:02X}");
        }
    }
    out
}

pub struct ModuleEncoder<'m> {
    module: &'m Module,
    contents: Vec<String>,
}

impl<'m> ModuleEncoder<'m> {
    pub fn new(module: &'m Module) -> ModuleEncoder<'m> {
        ModuleEncoder {
            module,
            contents: Vec::new(),
        }
    }

    pub fn writeln<T: Into<String>>(&mut self, line: T) {
        self.contents.push(line.into());
    }

    pub fn ty_name(&self, id: LoweredTypeID) -> String {
        match self.module.ty(id) {
            LLVMType::Primitive(p) => p.to_string(),
            LLVMType::Pointer(_) => "ptr".to_owned(),
            LLVMType::Array { elem, count } => format!("[{count} x {}]", self.ty_name(*elem)),
            LLVMType::Struct { name: Some(n), .. } => ident('%', *n).to_string(),
            LLVMType::Struct { name: None, body } => match body {
                Some(b) => self.body_text(&b.elements, b.packed),
                None => "{}".to_owned(),
            },
        }
    }

    fn body_text(&self, elements: &[LoweredTypeID], packed: bool) -> String {
        let inner = elements.iter().map(|e| self.ty_name(*e)).join(", ");
        if packed {
            format!("<{{ {inner} }}>")
        } else {
            format!("{{ {inner} }}")
        }
    }

    /// The constant with its type in front, the way it appears as an
    /// operand or a field of an aggregate constant
    pub fn typed(&self, c: &LLVMConst) -> String {
        match c {
            LLVMConst::Int { ty, .. } | LLVMConst::Float { ty, .. } | LLVMConst::Struct { ty, .. } => {
                format!("{} {}", self.ty_name(*ty), self.value(c))
            }
            LLVMConst::Zero(ty) => format!("{} zeroinitializer", self.ty_name(*ty)),
            LLVMConst::Array { elem, items } => {
                format!("[{} x {}] {}", items.len(), self.ty_name(*elem), self.value(c))
            }
            LLVMConst::CString(s) => format!("[{} x i8] {}", s.resolve().len() + 1, self.value(c)),
            LLVMConst::Null
            | LLVMConst::FunctionRef(_)
            | LLVMConst::GlobalRef(_)
            | LLVMConst::ElementRef { .. } => format!("ptr {}", self.value(c)),
        }
    }

    /// The constant without its type
    pub fn value(&self, c: &LLVMConst) -> String {
        match c {
            LLVMConst::Int { ty, value } => match self.module.ty(*ty) {
                LLVMType::Primitive(LLVMPrimitive::i1_t) => {
                    (if *value != 0 { "true" } else { "false" }).to_owned()
                }
                _ => value.to_string(),
            },
            LLVMConst::Float { ty, value } => {
                // llvm spells both float widths as the bits of a double
                let bits = match self.module.ty(*ty) {
                    LLVMType::Primitive(LLVMPrimitive::f32_t) => (*value as f32 as f64).to_bits(),
                    _ => value.to_bits(),
                };
                format!("0x{bits:016X}")
            }
            LLVMConst::Null => "null".to_owned(),
            LLVMConst::Zero(_) => "zeroinitializer".to_owned(),
            LLVMConst::Struct { ty, fields } => {
                let inner = fields.iter().map(|f| self.typed(f)).join(", ");
                let packed = match self.module.ty(*ty) {
                    LLVMType::Struct { body: Some(b), .. } => b.packed,
                    _ => true,
                };

                if packed {
                    format!("<{{ {inner} }}>")
                } else {
                    format!("{{ {inner} }}")
                }
            }
            LLVMConst::Array { items, .. } => {
                format!("[{}]", items.iter().map(|i| self.typed(i)).join(", "))
            }
            LLVMConst::FunctionRef(sym) => ident('@', *sym).to_string(),
            LLVMConst::GlobalRef(g) => ident('@', self.module.global(*g).name).to_string(),
            LLVMConst::ElementRef { global, index } => {
                let g = self.module.global(*global);
                format!(
                    "getelementptr ({}, ptr {}, i64 0, i64 {index})",
                    self.ty_name(g.ty),
                    ident('@', g.name)
                )
            }
            LLVMConst::CString(s) => {
                let mut bytes = s.resolve().as_bytes().to_vec();
                bytes.push(0);
                format!("c\"{}\"", escape(&bytes))
            }
        }
    }

    fn encode_types(&mut self) {
        let mut lines = Vec::new();

        for (_, ty) in self.module.types() {
            if let LLVMType::Struct { name: Some(n), body } = ty {
                let def = match body {
                    Some(b) => self.body_text(&b.elements, b.packed),
                    None => "opaque".to_owned(),
                };
                lines.push(format!("{} = type {def}", ident('%', *n)));
            }
        }

        for l in lines {
            self.writeln(l);
        }
    }

    fn encode_globals(&mut self) {
        let mut lines = Vec::new();

        for (_, g) in self.module.globals() {
            let kind = if g.constant { "constant" } else { "global" };
            let name = ident('@', g.name);

            lines.push(match &g.init {
                Some(c) => format!("{name} = {kind} {}", self.typed(c)),
                None => format!("{name} = external {kind} {}", self.ty_name(g.ty)),
            });
        }

        for l in lines {
            self.writeln(l);
        }
    }

    /// Declarations for every function symbol a table refers to
    fn encode_function_decls(&mut self) {
        fn collect(c: &LLVMConst, into: &mut Vec<IStr>) {
            match c {
                LLVMConst::FunctionRef(s) => into.push(*s),
                LLVMConst::Struct { fields: items, .. } | LLVMConst::Array { items, .. } => {
                    items.iter().for_each(|i| collect(i, into))
                }
                _ => {}
            }
        }

        let mut symbols = Vec::new();
        for (_, g) in self.module.globals() {
            if let Some(c) = &g.init {
                collect(c, &mut symbols);
            }
        }

        for s in symbols.into_iter().unique() {
            self.writeln(format!("declare void {}()", ident('@', s)));
        }
    }

    pub fn encode(mut self) -> String {
        self.writeln("; layout output start");
        self.encode_types();
        self.writeln("");
        self.encode_globals();
        self.writeln("");
        self.encode_function_decls();
        self.writeln("; layout output end");

        self.contents.join("\n") + "\n"
    }
}

pub fn encode_module(module: &Module) -> String {
    ModuleEncoder::new(module).encode()
}
