use super::CliCommand;

pub struct CommandParser;

impl CommandParser {
    pub fn get_available_commands() -> &'static [&'static str] {
        &[
            "help",
            "version",
            "status",
            "uptime",
            "clear",
            "flow",
            "wifi_status",
            "wifi_reset",
            "mqtt_status",
            "checkpoint",
            "reboot",
        ]
    }

    pub fn autocomplete(partial: &str) -> Vec<&'static str> {
        let commands = Self::get_available_commands();
        commands
            .iter()
            .filter(|&&cmd| cmd.starts_with(partial))
            .copied()
            .collect()
    }

    pub fn parse_command(input: &str) -> CliCommand {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return CliCommand::Empty;
        }

        let mut parts = trimmed.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let extra = parts.next();

        let command = match cmd {
            "help" => CliCommand::Help,
            "version" => CliCommand::Version,
            "status" => CliCommand::Status,
            "uptime" => CliCommand::Uptime,
            "clear" => CliCommand::Clear,
            "flow" => CliCommand::Flow,
            "wifi_status" => CliCommand::WifiStatus,
            "wifi_reset" => CliCommand::WifiReset,
            "mqtt_status" => CliCommand::MqttStatus,
            "checkpoint" => CliCommand::Checkpoint,
            "reboot" => CliCommand::Reboot,
            _ => return CliCommand::Unknown(cmd.to_string()),
        };

        match extra {
            // None of the commands take arguments; refuse rather than guess
            Some(_) => CliCommand::Unknown(format!("{}: takes no arguments", cmd)),
            None => command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(CommandParser::parse_command("  status "), CliCommand::Status);
        assert_eq!(CommandParser::parse_command("wifi_reset"), CliCommand::WifiReset);
        assert_eq!(CommandParser::parse_command("checkpoint"), CliCommand::Checkpoint);
        assert_eq!(CommandParser::parse_command(""), CliCommand::Empty);
    }

    #[test]
    fn unknown_and_extra_arguments() {
        assert_eq!(
            CommandParser::parse_command("frobnicate"),
            CliCommand::Unknown("frobnicate".to_string())
        );
        assert_eq!(
            CommandParser::parse_command("reboot now"),
            CliCommand::Unknown("reboot: takes no arguments".to_string())
        );
    }

    #[test]
    fn autocomplete_prefixes() {
        assert_eq!(CommandParser::autocomplete("wifi_"), vec!["wifi_status", "wifi_reset"]);
        assert_eq!(CommandParser::autocomplete("fl"), vec!["flow"]);
        assert!(CommandParser::autocomplete("zz").is_empty());
    }
}
