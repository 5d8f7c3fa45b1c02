use colored::*;
use itertools::Itertools;

use crate::{
    decl::{AggregateKind, DeclID, MethodSig},
    helper::interner::IStr,
};

/// Everything that stops layout or table construction for a declaration.
///
/// None of these are recovered from internally, the record that failed
/// stays undefined and the error goes back to whoever drives generation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("aggregate `{}` contains itself by value ({})", cycle_head(.path), render_path(.path))]
    CyclicLayout { path: Vec<IStr> },

    #[error("default value of `{aggregate}.{field}` was requested before it was resolved")]
    IncompleteInitializer { aggregate: IStr, field: IStr },

    #[error("`{class}` overrides `{method}` but it matches {candidates} inherited slots, expected exactly one")]
    DanglingOverride {
        class: IStr,
        method: MethodSig,
        candidates: usize,
    },

    #[error("`{class}` does not implement `{method}` required by interface `{iface}`")]
    UnimplementedInterfaceMethod {
        class: IStr,
        iface: IStr,
        method: MethodSig,
    },

    #[error("no declaration exists for {0}")]
    UnknownDeclaration(DeclID),

    #[error("`{decl}` is a {found}, expected {expected}")]
    WrongKind {
        decl: IStr,
        expected: &'static str,
        found: AggregateKind,
    },

    #[error("`{aggregate}` has no finalized layout yet")]
    NotDefined { aggregate: IStr },

    #[error("{table} of `{aggregate}` was read before it was defined")]
    DispatchNotDefined {
        aggregate: IStr,
        table: &'static str,
    },

    #[error("`{class}` does not realize interface `{iface}`")]
    InterfaceNotRealized { class: IStr, iface: IStr },

    #[error("field `{aggregate}.{field}` has a type of unknown size")]
    UnsizedField { aggregate: IStr, field: IStr },

    #[error("`{aggregate}` has no field named `{field}`")]
    UnknownField { aggregate: IStr, field: IStr },

    #[error("default value of `{aggregate}.{field}` does not fit the field type")]
    InvalidDefault { aggregate: IStr, field: IStr },
}

fn render_path(path: &[IStr]) -> String {
    path.iter().join(" -> ")
}

fn cycle_head(path: &[IStr]) -> String {
    path.first().map(|s| s.to_string()).unwrap_or_default()
}

/// Non fatal findings. Generation continues, but the driver should
/// show these to the user
#[derive(Clone, Debug, PartialEq)]
pub enum Diagnostic {
    /// Several interface default implementations could satisfy one slot
    AmbiguousInterfaceMethod {
        class: IStr,
        iface: IStr,
        method: MethodSig,
        chosen: IStr,
        candidates: Vec<IStr>,
    },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::AmbiguousInterfaceMethod {
                class,
                iface,
                method,
                chosen,
                candidates,
            } => write!(
                f,
                "`{class}` inherits several defaults for `{method}` of `{iface}` ({}), using `{chosen}`",
                candidates.iter().join(", ")
            ),
        }
    }
}

pub struct ErrorPrinter {}

impl ErrorPrinter {
    pub fn note_line(&self, line: String) {
        println!("{}", "This additional information was given for solving the issue:".yellow().bold());
        println!("   {} {}", ">".bright_blue().bold(), line.bright_yellow().bold());
    }

    pub fn error(&self, for_decl: IStr, err: &LayoutError) {
        println!(
            "{}: {} {}",
            "error".bold().bright_red(),
            format!("while laying out `{for_decl}`:").bold(),
            err.to_string().bright_yellow().bold()
        );

        match err {
            LayoutError::CyclicLayout { .. } => {
                self.note_line("break the cycle by holding one of the aggregates through a pointer or reference".to_owned())
            }
            LayoutError::IncompleteInitializer { .. } => {
                self.note_line("this is an ordering bug in the caller, field defaults must be resolved first".to_owned())
            }
            LayoutError::UnimplementedInterfaceMethod { .. } => {
                self.note_line("either implement the method or mark the class abstract".to_owned())
            }
            _ => {}
        }
    }

    pub fn warning(&self, diag: &Diagnostic) {
        println!("{}: {}", "warning".bold().yellow(), diag.to_string().bold());
    }

    pub fn print_bar(&self) {
        println!();
        if let Some((w, _)) = term_size::dimensions() {
            for _ in 0..w {
                print!("{}", "―".cyan());
            }
        }
        println!();
    }
}
