use which::which;

/// The eBPF object is linked by `bpf-linker`, which cargo does not know about.
/// Rebuild whenever the binary found on $PATH changes.
fn main() {
    let bpf_linker = which("bpf-linker").unwrap();
    println!("cargo:rerun-if-changed={}", bpf_linker.to_str().unwrap());
}
