use std::fs;
use std::path::{Path, PathBuf};

/// Only the gateway may talk to a connector's authenticated endpoints
const GATEWAY: &str = "src/exchange/gateway.rs";

const AUTHENTICATED_CALLS: &[&str] = &[
    "client.place_order(",
    "client.cancel_order(",
    "client.fetch_balances(",
    "client.fetch_open_orders(",
];

const NONCE_DRAWS: &[&str] = &["nonces.next(", ".next_unthrottled("];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

/// Non-test source lines of every file under src/, with repo-relative paths
fn production_lines() -> Vec<(String, usize, String)> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut lines = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(&file).unwrap_or_default();
        let all: Vec<&str> = content.lines().collect();
        for (idx, line) in all.iter().enumerate() {
            let trimmed = line.trim();
            let next = all.get(idx + 1).map(|l| l.trim()).unwrap_or_default();
            if trimmed == "#[cfg(test)]" && next.starts_with("mod tests") {
                break;
            }
            lines.push((rel.clone(), idx + 1, trimmed.to_string()));
        }
    }
    lines
}

fn offenders(patterns: &[&str], allowed: &[&str]) -> Vec<String> {
    production_lines()
        .into_iter()
        .filter(|(rel, _, line)| {
            !line.starts_with("//")
                && patterns.iter().any(|p| line.contains(p))
                && !allowed.contains(&rel.as_str())
        })
        .map(|(rel, n, line)| format!("{rel}:{n}: {line}"))
        .collect()
}

#[test]
fn authenticated_exchange_calls_go_through_the_gateway() {
    let found = offenders(AUTHENTICATED_CALLS, &[GATEWAY]);
    assert!(
        found.is_empty(),
        "authenticated exchange call outside the gateway:\n{}",
        found.join("\n")
    );
}

#[test]
fn nonces_are_only_drawn_inside_the_serialized_gateway_path() {
    let found = offenders(NONCE_DRAWS, &[GATEWAY, "src/signing/nonce_authority.rs"]);
    assert!(
        found.is_empty(),
        "nonce drawn outside the gateway:\n{}",
        found.join("\n")
    );
}
