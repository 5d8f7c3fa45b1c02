use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

use strata::decl::{AggregateDecl, AggregateKind, DeclID, DeclTable, DefaultValue, FieldDecl, Member, SemType, Virtuality};
use strata::encode::encode_module;
use strata::errors::ErrorPrinter;
use strata::helper::interner::Internable;
use strata::layout::LayoutRegistry;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
pub struct CFlags {
    pub quiet: bool,
    pub dump_layout: bool,
    pub output: Option<PathBuf>,
}

/// A small program's worth of declarations touching every layout feature
fn sample_decls() -> (DeclTable, Vec<DeclID>) {
    let mut decls = DeclTable::new();

    let point = decls.add(
        AggregateDecl::new("Point", AggregateKind::Struct)
            .with_field("x", SemType::F64, DefaultValue::Float(0.0))
            .with_field("y", SemType::F64, DefaultValue::Float(0.0)),
    );

    let word = decls.add(
        AggregateDecl::new("Word", AggregateKind::Union)
            .with_field("bits", SemType::I64, DefaultValue::Int(0))
            .with_member(Member::Struct(vec![
                Member::Field(FieldDecl {
                    name: "lo".intern(),
                    ty: SemType::I32,
                    default: DefaultValue::Zero,
                }),
                Member::Field(FieldDecl {
                    name: "hi".intern(),
                    ty: SemType::I32,
                    default: DefaultValue::Zero,
                }),
            ])),
    );

    let shape = decls.add(
        AggregateDecl::new("Shape", AggregateKind::Interface)
            .with_abstract_method("area", "fn() -> double", "Shape.area")
            .with_method("describe", "fn() -> ptr", "Shape.describe", Virtuality::Introduces),
    );

    let node = decls.reserve();
    decls.fill(
        node,
        AggregateDecl::new("Node", AggregateKind::Class)
            .with_field("origin", SemType::Aggregate(point), DefaultValue::Zero)
            .with_field("tag", SemType::Aggregate(word), DefaultValue::Zero)
            .with_field("next", SemType::Reference(node), DefaultValue::Null)
            .with_method("draw", "fn()", "Node.draw", Virtuality::Introduces)
            .with_abstract_method("area", "fn() -> double", "Node.area")
            .abstract_class(),
    );

    let circle = decls.add(
        AggregateDecl::new("Circle", AggregateKind::Class)
            .with_base(node)
            .with_interface(shape)
            .with_field("radius", SemType::F64, DefaultValue::Float(1.0))
            .with_method("area", "fn() -> double", "Circle.area", Virtuality::Overrides)
            .with_method("draw", "fn()", "Circle.draw", Virtuality::Overrides),
    );

    (decls, vec![point, word, shape, node, circle])
}

fn parse_args(args: &[&str]) -> CFlags {
    #[derive(Clone, Copy)]
    enum State {
        ExpectFlag,
        ExpectOutput,
    }

    let mut state = State::ExpectFlag;
    let mut cflags = CFlags::default();

    for s in args.iter() {
        match (state, *s) {
            (State::ExpectOutput, path) => {
                cflags.output = Some(PathBuf::from(path));
                state = State::ExpectFlag;
            }
            (State::ExpectFlag, "-o") => state = State::ExpectOutput,
            (State::ExpectFlag, "-q" | "--quiet") => cflags.quiet = true,
            (State::ExpectFlag, "-Dlayout") => cflags.dump_layout = true,
            (State::ExpectFlag, other) => {
                println!("Invalid argument: got '{}'", other);
                process::exit(-1)
            }
        }
    }

    if let State::ExpectOutput = state {
        println!("Expected a path after '-o'");
        process::exit(-1)
    }

    cflags
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let sliced: Vec<&str> = args.iter().skip(1).map(|s| &s[..]).collect();
    let cflags = parse_args(&sliced);

    let default_level = if cflags.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let (decls, roots) = sample_decls();
    let mut registry = LayoutRegistry::new(&decls);
    let printer = ErrorPrinter {};
    let mut failed = false;

    for id in roots {
        if let Err(e) = registry.finalize(id) {
            let name = decls.get(id).map(|d| d.name).unwrap_or_else(|| "<unknown>".intern());
            printer.error(name, &e);
            failed = true;
        }
    }

    for d in registry.diagnostics() {
        printer.warning(d);
    }

    if cflags.dump_layout {
        for (_, rec) in registry.records() {
            println!("{} ({}), size {}, align {}", rec.name, rec.kind, rec.size, rec.align);
            for (offset, group) in rec.offsets.iter() {
                for f in group.iter() {
                    println!("  {offset:>4}  {}", f.name);
                }
            }
        }
        printer.print_bar();
    }

    let text = encode_module(registry.module());
    match cflags.output {
        Some(path) => {
            if let Err(e) = fs::write(&path, text) {
                println!("could not write {}: {e}", path.display());
                process::exit(-1)
            }
        }
        None => print!("{text}"),
    }

    if failed {
        process::exit(1)
    }
}
