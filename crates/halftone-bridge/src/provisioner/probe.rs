//! Import probe for required packages
//!
//! Asking the interpreter to import each package is more reliable than
//! parsing `pip list`, whose format differs between pip versions.

use super::PackageRequirement;
use std::collections::HashSet;

/// Python snippet printing `ok:<name>` or `miss:<name>` per import name
pub fn probe_script(requirements: &[PackageRequirement]) -> String {
    let names: Vec<&str> = requirements.iter().map(|r| r.import_name.as_str()).collect();
    // A JSON array of plain strings is also a valid Python list literal
    let list = serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string());
    format!(
        "import importlib\n\
         for name in {list}:\n\
         \x20   try:\n\
         \x20       importlib.import_module(name)\n\
         \x20       print('ok:' + name)\n\
         \x20   except Exception:\n\
         \x20       print('miss:' + name)\n"
    )
}

/// Requirements the probe did not report as importable
///
/// `miss:` lines and packages the probe never mentioned both count as
/// missing.
pub fn parse_probe_output(
    output: &str,
    requirements: &[PackageRequirement],
) -> Vec<PackageRequirement> {
    let present: HashSet<&str> = output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("ok:"))
        .collect();

    requirements
        .iter()
        .filter(|req| !present.contains(req.import_name.as_str()))
        .cloned()
        .collect()
}
