use crate::parser::parse_timeout_spec;
use cmdrun_core::{CmdrunError, Result, TemplateConfig};

/// Parse a TOML command template document.
///
/// ```toml
/// argv = ["git"]
/// timeout = "2:TERM, 5:KILL"
/// allowed_sub_commands = ["pull", "push"]
///
/// [environment]
/// GIT_TERMINAL_PROMPT = "0"
/// ```
pub fn parse_template_config(input: &str) -> Result<TemplateConfig> {
    let config: TemplateConfig = toml::from_str(input)
        .map_err(|e| CmdrunError::ParseError(format!("Invalid template config: {}", e)))?;

    if config.argv.is_empty() {
        return Err(CmdrunError::InvalidConfiguration(
            "Template argv must name at least the program".to_string(),
        ));
    }

    if let Some(timeout) = &config.timeout {
        parse_timeout_spec(timeout)?;
    }

    Ok(config)
}
