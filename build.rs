use std::fs;

fn reqwest_version() -> Option<String> {
    let cargo_lock = fs::read_to_string("Cargo.lock").ok()?;
    let lockfile: toml::Value = toml::from_str(&cargo_lock).ok()?;
    lockfile
        .get("package")?
        .as_array()?
        .iter()
        .find(|pkg| pkg.get("name").and_then(toml::Value::as_str) == Some("reqwest"))
        .and_then(|pkg| pkg.get("version"))
        .and_then(toml::Value::as_str)
        .map(ToString::to_string)
}

fn main() {
    // reqwest version extraction, for the User-Agent header
    let reqwest_version = reqwest_version().unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=REQWEST_VERSION={reqwest_version}");
    println!("cargo::rerun-if-changed=Cargo.lock");
}
