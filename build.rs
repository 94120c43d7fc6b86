use std::fs;
use std::path::{Path, PathBuf};

// The curvature core only sees captured tensors; it must not reach into a
// concrete autodiff engine.
const FORBIDDEN: [&str; 5] = [
    "tch::",
    "candle_core::",
    "burn::",
    "register_backward_hook",
    "requires_grad",
];

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let mut sources = Vec::new();
    collect_sources(Path::new("src"), &mut sources);

    let violations: Vec<String> = sources
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok().map(|text| (path, text)))
        .flat_map(|(path, text)| {
            text.lines()
                .enumerate()
                .flat_map(|(idx, line)| {
                    FORBIDDEN
                        .iter()
                        .filter(|token| line.contains(*token))
                        .map(|token| format!("{}:{} uses '{token}'", path.display(), idx + 1))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        })
        .collect();

    if !violations.is_empty() {
        eprintln!("\nerror: kfac core modules depend on a host autodiff engine:");
        for v in &violations {
            eprintln!("  - {v}");
        }
        panic!("host-engine boundary violated in kfac core modules");
    }
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|e| e.path()) {
        if path.is_dir() {
            collect_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}
