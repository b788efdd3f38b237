use std::{env, fs, path::PathBuf};

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        println!("cargo:rustc-link-arg-bins=-T{}/kernel.ld", manifest_dir);
    }
    println!("cargo:rerun-if-changed=kernel.ld");

    // Flat user init image, built from the user_init crate with `user_bin`.
    println!("cargo:rerun-if-env-changed=USER_INIT_IMAGE");
    let image = match env::var("USER_INIT_IMAGE") {
        Ok(path) => {
            println!("cargo:rerun-if-changed={}", path);
            PathBuf::from(path)
        }
        Err(_) => {
            let empty = out_dir.join("user_init.bin");
            fs::write(&empty, []).unwrap();
            empty
        }
    };
    println!("cargo:rustc-env=USER_INIT_IMAGE={}", image.display());
}
