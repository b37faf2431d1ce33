//! Issue body rendering.
//!
//! Every body carries the same eight fields; a custom template must reference
//! all of them and every rendered value is non-empty.

use serde_json::Value;

use crate::error::TrackingError;
use crate::template::TemplateStatus;

use super::{EnvironmentNotice, IssueContext, NoticeState};

pub const FIELDS: [&str; 8] = [
    "SECRETS_SECTION",
    "PLAN",
    "ARTIFACT_DIR",
    "METADATA_PATH",
    "RUN_URL",
    "TARGETS_LIST",
    "TEMPLATE_SECTION",
    "OVERRIDES_BY_ENV",
];

pub const DEFAULT_TEMPLATE: &str = "## Promotion overrides

Set the override secrets listed below for each target environment, then close
this issue to confirm they are ready. Rerun the promotion after editing.

{SECRETS_SECTION}

| | |
|---|---|
| Plan | `{PLAN}` |
| Artifact directory | `{ARTIFACT_DIR}` |
| Metadata | `{METADATA_PATH}` |
| Run | {RUN_URL} |

### Target environments

{TARGETS_LIST}

### Template

{TEMPLATE_SECTION}

### Suggested overrides

{OVERRIDES_BY_ENV}
";

/// Check that `template` references every field.
pub fn validate_template(template: &str) -> Result<(), TrackingError> {
    for field in FIELDS {
        if !template.contains(&format!("{{{field}}}")) {
            return Err(TrackingError::IncompleteTemplate(field.to_string()));
        }
    }
    Ok(())
}

pub fn title(context: &IssueContext) -> String {
    format!(
        "Promotion overrides: {} / {}",
        context.plan, context.artifact_name
    )
}

/// Render `template` for `context`.
pub fn render(template: &str, context: &IssueContext) -> Result<String, TrackingError> {
    validate_template(template)?;

    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;

    // Single pass, so a value containing `{PLAN}` is never expanded again
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let field = after
            .find('}')
            .map(|close| &after[..close])
            .filter(|name| FIELDS.contains(name));
        match field {
            Some(name) => {
                out.push_str(&field_value(name, context));
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    Ok(out)
}

fn field_value(name: &str, context: &IssueContext) -> String {
    let value = match name {
        "SECRETS_SECTION" => secrets_section(&context.environments),
        "PLAN" => context.plan.clone(),
        "ARTIFACT_DIR" => context.artifact_dir.display().to_string(),
        "METADATA_PATH" => context.metadata_path.display().to_string(),
        "RUN_URL" => context.run_url.clone(),
        "TARGETS_LIST" => targets_list(&context.environments),
        "TEMPLATE_SECTION" => template_section(context),
        "OVERRIDES_BY_ENV" => overrides_by_env(&context.environments),
        _ => String::new(),
    };
    if value.trim().is_empty() {
        "_none_".to_string()
    } else {
        value
    }
}

fn secrets_section(environments: &[EnvironmentNotice]) -> String {
    environments
        .iter()
        .map(|env| {
            let gate = if env.requires_approval {
                "approval required"
            } else {
                "no approval"
            };
            format!(
                "- `{}` reads secret `{}` ({}): {}",
                env.name,
                env.override_secret_key,
                gate,
                describe_state(&env.state)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_state(state: &NoticeState) -> String {
    match state {
        NoticeState::Pending => "pending".to_string(),
        NoticeState::OverridesMissing(reason) => format!("**override set missing**: {reason}"),
        NoticeState::KeysMissing(keys) => format!(
            "**missing keys** {}",
            keys.iter()
                .map(|k| format!("`{k}`"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        NoticeState::AwaitingApproval => "awaiting approval".to_string(),
        NoticeState::Imported => "imported".to_string(),
        NoticeState::Failed(reason) => format!("failed: {reason}"),
    }
}

fn targets_list(environments: &[EnvironmentNotice]) -> String {
    environments
        .iter()
        .enumerate()
        .map(|(i, env)| format!("{}. `{}`", i + 1, env.name))
        .collect::<Vec<_>>()
        .join("\n")
}

fn template_section(context: &IssueContext) -> String {
    let source = context.template_source.as_deref().unwrap_or("the template");
    let mut parts = Vec::new();
    match context.template_status {
        TemplateStatus::Missing => {
            return "> **Note:** the artifact carries no ICF template; no overrides are needed."
                .to_string();
        }
        TemplateStatus::Fallback => parts.push(format!(
            "> **Note:** the artifact carries no ICF template; using the fallback `{source}`."
        )),
        TemplateStatus::Ready | TemplateStatus::Empty => {}
    }

    if let Some(excerpt) = &context.template_excerpt {
        parts.push(format!(
            "### Template extract (`{source}`)\n```properties\n{excerpt}\n```"
        ));
    }
    if context.required_keys.is_empty() {
        parts.push("The template has no keys; no overrides are needed.".to_string());
    } else {
        parts.push(format!(
            "Required keys: {}",
            context
                .required_keys
                .iter()
                .map(|k| format!("`{k}`"))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    parts.join("\n\n")
}

fn overrides_by_env(environments: &[EnvironmentNotice]) -> String {
    environments
        .iter()
        .map(|env| {
            let suggested = Value::Object(env.suggested_overrides.clone());
            format!(
                "#### {} (`{}`)\n\n```json\n{:#}\n```",
                env.name, env.override_secret_key, suggested
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
