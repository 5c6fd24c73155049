use std::env;
use std::path::{Path, PathBuf};

const HEADER: &str = "ucp/api/ucp.h";

fn main() {
    println!("cargo:rerun-if-env-changed=UCX_DIR");

    println!("cargo:rustc-link-lib=ucp");
    println!("cargo:rustc-link-lib=ucs");
    println!("cargo:rustc-link-lib=uct");

    let mut builder = bindgen::Builder::default()
        .header_contents("wrapper.h", "#include <ucp/api/ucp.h>\n")
        // Context, worker, endpoint, memory and RMA entry points.
        .allowlist_function("ucp_(init_version|cleanup|config_.*)")
        .allowlist_function("ucp_worker_.*")
        .allowlist_function("ucp_ep_.*")
        .allowlist_function("ucp_mem_.*")
        .allowlist_function("ucp_rkey_.*")
        .allowlist_function("ucp_put_nbx")
        .allowlist_function("ucp_request_.*")
        .allowlist_function("ucs_status_string")
        .allowlist_type("ucp_.*")
        .allowlist_type("ucs_.*")
        .allowlist_var("UCP_.*")
        .allowlist_var("UCS_.*")
        .layout_tests(false);

    if let Some(prefix) = find_ucx_prefix() {
        let include = prefix.join("include");
        builder = builder.clang_arg(format!("-I{}", include.display()));
        for lib in ["lib", "lib64"] {
            let dir = prefix.join(lib);
            if dir.is_dir() {
                println!("cargo:rustc-link-search=native={}", dir.display());
            }
        }
    }

    let bindings = builder
        .generate()
        .expect("failed to generate UCX bindings; is the UCX development package installed?");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    bindings
        .write_to_file(out_dir.join("bindings.rs"))
        .expect("failed to write UCX bindings");
}

/// Locate the UCX install prefix: `UCX_DIR`, the usual system prefixes, then pkg-config.
fn find_ucx_prefix() -> Option<PathBuf> {
    if let Ok(dir) = env::var("UCX_DIR") {
        let prefix = PathBuf::from(dir);
        if has_header(&prefix.join("include")) {
            return Some(prefix);
        }
    }

    for prefix in ["/usr", "/usr/local", "/opt/ucx"] {
        let prefix = PathBuf::from(prefix);
        if has_header(&prefix.join("include")) {
            return Some(prefix);
        }
    }

    let output = std::process::Command::new("pkg-config")
        .args(["--cflags", "ucx"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter_map(|flag| flag.strip_prefix("-I"))
        .map(PathBuf::from)
        .find(|include| has_header(include))
        .and_then(|include| include.parent().map(Path::to_path_buf))
}

fn has_header(include: &Path) -> bool {
    include.join(HEADER).exists()
}
