use std::fs;
use std::path::Path;

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let src = Path::new(&manifest_dir).join("src");

    let observability = src.join("observability.rs");
    println!("cargo:rerun-if-changed={}", observability.display());
    enforce_guards(
        &observability,
        &[
            "std::net",
            "Ipv4Addr",
            "PeerId",
            "SystemTime",
            "Instant",
            "println!(",
            "eprintln!(",
        ],
    );

    let slots = src.join("hasher").join("slots.rs");
    println!("cargo:rerun-if-changed={}", slots.display());
    enforce_guards(
        &slots,
        &["unsafe", "std::process", "std::net", "std::fs", "tokio::"],
    );
}

fn enforce_guards(path: &Path, forbidden: &[&str]) {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return,
    };
    for token in forbidden {
        if contents.contains(token) {
            panic!("Forbidden token `{}` in {}", token, path.display());
        }
    }
}
