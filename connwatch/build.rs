use anyhow::{Context as _, anyhow};
use aya_build::{
    Toolchain,
    cargo_metadata::{Metadata, MetadataCommand, Package},
};

fn main() -> anyhow::Result<()> {
    let Metadata { packages, .. } = MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let ebpf_package = packages
        .into_iter()
        .find(|Package { name, .. }| name.as_str() == "connwatch-ebpf")
        .ok_or_else(|| anyhow!("connwatch-ebpf package not found"))?;
    aya_build::build_ebpf([ebpf_package], Toolchain::default())
}
