//! Stored prompt templates.
//!
//! A request naming `prompt_name` has its messages replaced by the stored
//! template with `{{key}}` placeholders substituted from
//! `prompt_variables`. Substitution is single pass, so variable values
//! containing `{{...}}` are never re-expanded.

use std::collections::BTreeMap;

use tianji_common::GatewayError;
use tianji_protocol::openai::{ChatCompletionRequest, ChatMessage};
use tianji_storage::{Storage, StorageError};

pub async fn resolve_prompt(
    storage: &dyn Storage,
    req: &mut ChatCompletionRequest,
) -> Result<(), GatewayError> {
    let Some(name) = req.prompt_name.clone() else {
        return Ok(());
    };

    let row = match req.prompt_version {
        Some(version) => storage.prompt_by_name_version(&name, version).await,
        None => storage.latest_prompt(&name).await,
    }
    .map_err(storage_error)?;

    let Some(row) = row else {
        let version = req
            .prompt_version
            .map(|v| format!(" version {v}"))
            .unwrap_or_default();
        return Err(
            GatewayError::invalid_request(format!("prompt template {name}{version} not found"))
                .with_code("prompt_not_found"),
        );
    };

    let empty = BTreeMap::new();
    let vars = req.prompt_variables.as_ref().unwrap_or(&empty);
    let text = substitute(&row.template, vars);

    req.messages = vec![ChatMessage::user(text)];
    req.clear_prompt_fields();
    Ok(())
}

fn storage_error(err: StorageError) -> GatewayError {
    GatewayError::internal(format!("prompt storage error: {err}"))
}

/// Replace `{{key}}` with the variable's value. Unknown keys keep the
/// placeholder verbatim. Substituted values are emitted as-is, never
/// re-scanned.
fn substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
