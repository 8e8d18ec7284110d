/// Input validation for identities, names and commands crossing into the node
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Player name cannot be empty")]
    PlayerNameEmpty,

    #[error("Player name too long (max 16 characters, got {0})")]
    PlayerNameTooLong(usize),

    #[error("Player name contains invalid characters (only alphanumeric and underscore allowed)")]
    PlayerNameInvalidChars,

    #[error("Server name cannot be empty")]
    ServerNameEmpty,

    #[error("Server name too long (max 64 characters, got {0})")]
    ServerNameTooLong(usize),

    #[error("Node id cannot be empty")]
    NodeIdEmpty,

    #[error("Node id too long (max 64 characters, got {0})")]
    NodeIdTooLong(usize),

    #[error("Node id may only contain alphanumerics, '-', '_' and '.'")]
    NodeIdInvalidChars,

    #[error("Command cannot be empty")]
    CommandEmpty,

    #[error("Command too long (max {max} characters, got {actual})")]
    CommandTooLong { max: usize, actual: usize },
}

/// Validates a player name
///
/// Rules:
/// - Cannot be empty
/// - Max 16 characters (Minecraft username limit)
/// - Only alphanumeric characters and underscores
pub fn validate_player_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::PlayerNameEmpty);
    }

    if name.len() > 16 {
        return Err(ValidationError::PlayerNameTooLong(name.len()));
    }

    if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(ValidationError::PlayerNameInvalidChars);
    }

    Ok(())
}

/// Validates a backend server name
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::ServerNameEmpty);
    }

    if trimmed.len() > 64 {
        return Err(ValidationError::ServerNameTooLong(trimmed.len()));
    }

    Ok(())
}

/// Validates a proxy node id
///
/// Node ids are embedded in store keys (`proxy:<id>:usersOnline`) and channel
/// names, so separators and whitespace are not allowed.
pub fn validate_node_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::NodeIdEmpty);
    }

    if id.len() > 64 {
        return Err(ValidationError::NodeIdTooLong(id.len()));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::NodeIdInvalidChars);
    }

    Ok(())
}

/// Validates an administrative command before it is broadcast
pub fn validate_command(command: &str) -> Result<(), ValidationError> {
    const MAX_LEN: usize = 256;

    let body = command.trim().trim_start_matches('/');
    if body.trim().is_empty() {
        return Err(ValidationError::CommandEmpty);
    }

    if command.len() > MAX_LEN {
        return Err(ValidationError::CommandTooLong {
            max: MAX_LEN,
            actual: command.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_player_names() {
        assert!(validate_player_name("Steve").is_ok());
        assert!(validate_player_name("Player_123").is_ok());
        assert!(validate_player_name("1234567890123456").is_ok()); // exactly 16 chars
    }

    #[test]
    fn test_invalid_player_names() {
        assert_eq!(
            validate_player_name(""),
            Err(ValidationError::PlayerNameEmpty)
        );
        assert_eq!(
            validate_player_name("12345678901234567"),
            Err(ValidationError::PlayerNameTooLong(17))
        );
        assert_eq!(
            validate_player_name("bad name"),
            Err(ValidationError::PlayerNameInvalidChars)
        );
    }

    #[test]
    fn test_server_names() {
        assert!(validate_server_name("lobby-1").is_ok());
        assert_eq!(
            validate_server_name("   "),
            Err(ValidationError::ServerNameEmpty)
        );
        assert_eq!(
            validate_server_name(&"a".repeat(65)),
            Err(ValidationError::ServerNameTooLong(65))
        );
    }

    #[test]
    fn test_node_ids() {
        assert!(validate_node_id("bungee-1").is_ok());
        assert!(validate_node_id("eu.proxy_2").is_ok());
        assert_eq!(validate_node_id(""), Err(ValidationError::NodeIdEmpty));
        assert_eq!(
            validate_node_id("proxy:1"),
            Err(ValidationError::NodeIdInvalidChars)
        );
        assert_eq!(
            validate_node_id("proxy 1"),
            Err(ValidationError::NodeIdInvalidChars)
        );
    }

    #[test]
    fn test_commands() {
        assert!(validate_command("/alert hello").is_ok());
        assert!(validate_command("glist").is_ok());
        assert_eq!(validate_command("/"), Err(ValidationError::CommandEmpty));
        assert_eq!(validate_command("  "), Err(ValidationError::CommandEmpty));
        assert!(matches!(
            validate_command(&"x".repeat(300)),
            Err(ValidationError::CommandTooLong { .. })
        ));
    }
}
