//! `phaseflow resolve`: show where a name resolves.

use anyhow::Result;
use console::style;
use phaseflow_types::artifact::ArtifactKind;

use crate::state::AppState;

pub fn handle_resolve(state: &AppState, kind: ArtifactKind, name: &str, json: bool) -> Result<()> {
    let resolution = state.layout.resolver().resolve(kind, name)?;

    if json {
        let out = serde_json::json!({
            "kind": kind.as_str(),
            "name": name,
            "path": resolution.path,
            "source": resolution.source.to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "{} {} {}",
            resolution.path.display(),
            style("from").dim(),
            style(resolution.source).cyan()
        );
    }
    Ok(())
}
