use serde::{Deserialize, Serialize};

/// Command relayed by the chat front-end
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Chat user id of the sender
    pub caller_id: String,
    /// Raw message text, e.g. `/fail2ban status sshd`
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub reply: String,
}
