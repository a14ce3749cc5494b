use std::collections::HashMap;

use crate::logging;
use crate::runner::run_context::{lock, MappableOutput, RunContextHandle};

/// A workflow command parsed from a step's output:
/// `::command key=value,key2=value2::data`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCommand {
    pub command: String,
    pub properties: HashMap<String, String>,
    pub data: String,
}

const COMMAND_KEY: &str = "::";

impl ActionCommand {
    pub fn parse(line: &str) -> Option<ActionCommand> {
        let trimmed = line.trim_start();
        if !trimmed.starts_with(COMMAND_KEY) {
            return None;
        }

        let after_prefix = &trimmed[COMMAND_KEY.len()..];
        let end_index = after_prefix.find(COMMAND_KEY)?;
        let cmd_info = &after_prefix[..end_index];
        let data = &after_prefix[end_index + COMMAND_KEY.len()..];

        let (command, properties_str) = match cmd_info.find(' ') {
            Some(idx) => (&cmd_info[..idx], cmd_info[idx + 1..].trim()),
            None => (cmd_info, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut properties = HashMap::new();
        for entry in properties_str.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some(eq) = entry.find('=') {
                let key = &entry[..eq];
                let value = &entry[eq + 1..];
                if !key.is_empty() {
                    properties.insert(key.to_string(), unescape_property(value));
                }
            }
        }

        Some(ActionCommand {
            command: command.to_string(),
            properties,
            data: unescape_data(data),
        })
    }
}

fn unescape_data(data: &str) -> String {
    data.replace("%0D", "\r").replace("%0A", "\n").replace("%25", "%")
}

fn unescape_property(value: &str) -> String {
    value
        .replace("%0D", "\r")
        .replace("%0A", "\n")
        .replace("%3A", ":")
        .replace("%2C", ",")
        .replace("%25", "%")
}

/// A [`LineWriter`](crate::logging::LineWriter) handler that intercepts
/// workflow commands and applies them to the run context. Returns `false`
/// for handled command lines so they do not reach the log.
pub fn command_handler(rc: RunContextHandle) -> impl FnMut(&str) -> bool + Send {
    move |line: &str| {
        let command = match ActionCommand::parse(line) {
            Some(command) => command,
            None => return true,
        };

        match command.command.as_str() {
            "set-output" => {
                let name = match command.properties.get("name") {
                    Some(name) => name.clone(),
                    None => {
                        logging::warning("set-output command without a name property");
                        return false;
                    }
                };
                let mut g = lock(&rc);
                let step_id = g.current_step.clone();
                if let Some(result) = g.step_results.get_mut(&step_id) {
                    result
                        .outputs
                        .insert(name.clone(), command.data.clone());
                }
                // composite actions re-export outputs under their declared
                // names through the mapping table
                let key = MappableOutput {
                    step_id: step_id.clone(),
                    output_name: name,
                };
                if let Some(mapped) = g.output_mappings.get(&key).cloned() {
                    if let Some(result) = g.step_results.get_mut(&mapped.step_id) {
                        result.outputs.insert(mapped.output_name, command.data);
                    }
                }
                false
            }
            "set-env" => {
                if let Some(name) = command.properties.get("name") {
                    let mut g = lock(&rc);
                    let env = g.get_env_handle();
                    drop(g);
                    let lock_result = env.lock();
                    if let Ok(mut env) = lock_result {
                        env.insert(name.clone(), command.data);
                    }
                } else {
                    logging::warning("set-env command without a name property");
                }
                false
            }
            "add-path" => {
                lock(&rc).extra_path.push(command.data);
                false
            }
            "add-mask" => {
                logging::debug("add-mask received");
                false
            }
            "error" => {
                logging::error(&command.data);
                false
            }
            "warning" => {
                logging::warning(&command.data);
                false
            }
            "debug" => {
                logging::debug(&command.data);
                false
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_with_properties_and_data() {
        let command =
            ActionCommand::parse("::set-output name=result::built in 3s").unwrap();
        assert_eq!(command.command, "set-output");
        assert_eq!(command.properties.get("name").unwrap(), "result");
        assert_eq!(command.data, "built in 3s");
    }

    #[test]
    fn test_parse_command_without_properties() {
        let command = ActionCommand::parse("::debug::checking cache").unwrap();
        assert_eq!(command.command, "debug");
        assert!(command.properties.is_empty());
        assert_eq!(command.data, "checking cache");
    }

    #[test]
    fn test_parse_unescapes_data_and_properties() {
        let command =
            ActionCommand::parse("::set-output name=multi::line1%0Aline2%25").unwrap();
        assert_eq!(command.data, "line1\nline2%");

        let command = ActionCommand::parse("::warning file=a%3Ab::careful").unwrap();
        assert_eq!(command.properties.get("file").unwrap(), "a:b");
    }

    #[test]
    fn test_parse_rejects_plain_lines() {
        assert!(ActionCommand::parse("plain output").is_none());
        assert!(ActionCommand::parse(":: not a command").is_none());
        assert!(ActionCommand::parse("::unfinished").is_none());
    }
}
