/// Gateway intent bits relevant to message listening.
pub const GUILDS: u64 = 1 << 0;
pub const GUILD_MESSAGES: u64 = 1 << 9;
pub const DIRECT_MESSAGES: u64 = 1 << 12;
pub const MESSAGE_CONTENT: u64 = 1 << 15;

/// Intents that must be enabled for the application before the gateway
/// accepts them (close code 4014 otherwise).
pub const PRIVILEGED: u64 = (1 << 1) | (1 << 8) | MESSAGE_CONTENT;

/// Guild messages with their content: what the listener needs.
pub const DEFAULT_INTENTS: u64 = GUILD_MESSAGES | MESSAGE_CONTENT;

/// Prefix that marks a bot-style credential.
pub const BOT_TOKEN_PREFIX: &str = "Bot ";

const NAMES: &[(u64, &str)] = &[
    (GUILDS, "guilds"),
    (1 << 1, "guild_members"),
    (1 << 8, "guild_presences"),
    (GUILD_MESSAGES, "guild_messages"),
    (DIRECT_MESSAGES, "direct_messages"),
    (MESSAGE_CONTENT, "message_content"),
];

pub fn is_bot_token(token: &str) -> bool {
    token.starts_with(BOT_TOKEN_PREFIX)
}

/// Intents to send in IDENTIFY. User-style tokens omit the field entirely.
pub fn identify_intents(token: &str, intents: u64) -> Option<u64> {
    is_bot_token(token).then_some(intents)
}

/// Names of the privileged intents requested in `intents`, for diagnostics
/// when the gateway rejects them.
pub fn privileged_names(intents: u64) -> Vec<&'static str> {
    NAMES
        .iter()
        .filter(|(bit, _)| PRIVILEGED & bit & intents != 0)
        .map(|(_, name)| *name)
        .collect()
}
