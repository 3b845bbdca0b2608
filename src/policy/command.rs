use super::{CommandPolicy, Rejection};

/// Characters that would let a command chain, substitute or open a subshell.
const SHELL_METACHARACTERS: &[char] = &['\n', '\r', ';', '|', '&', '`', '$', '(', ')', '\\'];

impl CommandPolicy {
    /// Check a command against the policy. First failing rule wins:
    /// empty, length, metacharacters, forbidden commands, forbidden patterns.
    pub fn validate_command(&self, command: &str) -> Result<(), Rejection> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(Rejection::Empty);
        }
        if trimmed.chars().count() > self.max_command_length {
            return Err(Rejection::TooLong {
                limit: self.max_command_length,
            });
        }
        if let Some(c) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            return Err(Rejection::Metacharacter(c));
        }
        if let Some((token, _)) = self
            .forbidden_commands
            .iter()
            .find(|(_, re)| re.is_match(command))
        {
            return Err(Rejection::ForbiddenCommand(token.clone()));
        }
        if let Some((pattern, _)) = self
            .forbidden_patterns
            .iter()
            .find(|(_, re)| re.is_match(command))
        {
            return Err(Rejection::ForbiddenPattern(pattern.clone()));
        }
        Ok(())
    }
}
