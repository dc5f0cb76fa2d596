//! Build script for the `adept-openstack` man pages.
//!
//! Renders `adept-openstack.1` plus one page per subcommand into the build
//! output directory, where packaging picks them up.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const PROGRAM: &str = "adept-openstack";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    write_page(&out_dir, PROGRAM, &Man::new(command.clone()))?;
    for subcommand in command.get_subcommands() {
        let page = format!("{PROGRAM}-{}", subcommand.get_name());
        write_page(
            &out_dir,
            &page,
            &Man::new(subcommand.clone()).title(page.to_uppercase()),
        )?;
    }

    Ok(())
}

fn write_page(out_dir: &Path, page: &str, man: &Man) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    let mut file = File::create(out_dir.join(format!("{page}.1")))?;
    file.write_all(&buffer)?;
    Ok(())
}
