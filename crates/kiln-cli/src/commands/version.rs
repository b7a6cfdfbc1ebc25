use kiln_core::VERSION;
use kiln_core::version::version_string;
use miette::{IntoDiagnostic, Result};

pub fn run(json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "name": "kiln",
            "version": VERSION,
            "full": version_string(),
        });
        println!("{}", serde_json::to_string(&value).into_diagnostic()?);
    } else {
        println!("{}", version_string());
    }
    Ok(())
}
