// Compiles every GLSL compute shader under shaders/ to SPIR-V next to its source
// (shaders/foo.comp -> shaders/foo.comp.spv). Needs glslc from the Vulkan SDK.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const SHADER_DIR: &str = "shaders";

fn main() {
    println!("cargo:rerun-if-changed={}", SHADER_DIR);

    let sources = match compute_sources(Path::new(SHADER_DIR)) {
        Ok(sources) => sources,
        Err(e) => {
            println!("cargo:warning=cannot read {}/ ({}), no shaders compiled", SHADER_DIR, e);
            return;
        }
    };

    for source in &sources {
        println!("cargo:rerun-if-changed={}", source.display());
        let mut output = source.clone().into_os_string();
        output.push(".spv");
        if !compile_shader(source, Path::new(&output)) {
            // Without glslc the remaining shaders would fail the same way
            break;
        }
    }
}

/// `*.comp` files in `dir`, sorted so the build output is stable
fn compute_sources(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "comp") {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}

/// Returns false when glslc itself could not be launched
fn compile_shader(input: &Path, output: &Path) -> bool {
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.2")
        .arg(input)
        .arg("-o")
        .arg(output)
        .status();

    match result {
        Ok(status) if status.success() => true,
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input.display(), status.code());
        }
        Err(e) => {
            println!(
                "cargo:warning=glslc not found ({}), {} was not rebuilt",
                e,
                output.display()
            );
            eprintln!("Install the Vulkan SDK or compile manually:");
            eprintln!("  glslc {} -o {}", input.display(), output.display());
            false
        }
    }
}
