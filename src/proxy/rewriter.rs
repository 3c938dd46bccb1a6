//! Presence stanza rewriting and the synthetic "Deceive" contact.
//!
//! The chat stream is never parsed as XML. Riot's XMPP framing reliably
//! delivers each `<presence>`, `<message>` and roster `<iq>` fragment inside a
//! single TCP chunk, so all rewriting is done with anchored regex
//! substitutions over a UTF-8 view of the chunk. When a fragment does arrive
//! split across chunks the substitutions simply find nothing and the chunk is
//! forwarded untouched; correctness of the stream always wins over hiding.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::Utc;
use regex::Regex;
use tracing::debug;
use uuid::Uuid;

/// JID of the synthetic roster contact that hosts the command channel.
pub const FAKE_JID: &str = "41c322a1-b328-495b-a004-5ccd3e45eae8@eu1.pvp.net";

/// Resource used for the fake contact's resource-qualified JID.
pub const FAKE_RESOURCE: &str = "RC-Deceive";

const FAKE_PUUID: &str = "41c322a1-b328-495b-a004-5ccd3e45eae8";

/// Leading tab sorts the contact above real friends in the client UI.
const FAKE_NAME: &str = "\tDeceive Active!";

/// Literal open tag of the roster query the client receives from the server.
const ROSTER_OPEN_MARKER: &str = "<query xmlns='jabber:iq:riotgames:roster'>";

/// How the user wants to appear to their friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceMode {
    Offline,
    Mobile,
    Online,
}

impl PresenceMode {
    /// Token used inside `<show>` and game `<st>` tags on the wire.
    pub fn wire_token(self) -> &'static str {
        match self {
            PresenceMode::Offline => "offline",
            PresenceMode::Mobile => "mobile",
            PresenceMode::Online => "chat",
        }
    }

    /// Human-readable form used in messages from the fake contact.
    pub fn label(self) -> &'static str {
        match self {
            PresenceMode::Offline => "offline",
            PresenceMode::Mobile => "mobile",
            PresenceMode::Online => "online",
        }
    }
}

impl FromStr for PresenceMode {
    type Err = String;

    /// Accepts the persisted/CLI names plus the literal wire token `chat`.
    /// Unknown strings are an error, never silently mapped to a default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offline" => Ok(PresenceMode::Offline),
            "mobile" => Ok(PresenceMode::Mobile),
            "online" | "chat" => Ok(PresenceMode::Online),
            other => Err(format!(
                "unknown presence status '{other}' (expected offline, mobile or online)"
            )),
        }
    }
}

impl fmt::Display for PresenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A command the user sent by chatting with the fake contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    Offline,
    Mobile,
    Online,
    Enable,
    Disable,
    Status,
    Help,
}

struct Patterns {
    show: Regex,
    status: Regex,
    games_league_st: Regex,
    league_block: Regex,
    league_p: Regex,
    league_m: Regex,
    valorant_block: Regex,
    valorant_version: Regex,
    bacon_block: Regex,
    lion_block: Regex,
    keystone_block: Regex,
    riot_client_block: Regex,
    message_body: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        show: Regex::new(r"(?s)<show>.*?</show>").expect("show pattern"),
        status: Regex::new(r"(?s)<status>.*?</status>").expect("status pattern"),
        games_league_st: Regex::new(r"(?s)(<games>.*?<league_of_legends>.*?)<st>[^<]*</st>")
            .expect("league st pattern"),
        league_block: Regex::new(r"(?s)<league_of_legends>.*?</league_of_legends>")
            .expect("league block pattern"),
        league_p: Regex::new(r"(?s)<p>.*?</p>").expect("league p pattern"),
        league_m: Regex::new(r"(?s)<m>.*?</m>").expect("league m pattern"),
        valorant_block: Regex::new(r"(?s)<valorant>.*?</valorant>").expect("valorant pattern"),
        valorant_version: Regex::new(r"(?s)<valorant>.*?<p>([^<]+)</p>")
            .expect("valorant version pattern"),
        bacon_block: Regex::new(r"(?s)<bacon>.*?</bacon>").expect("bacon pattern"),
        lion_block: Regex::new(r"(?s)<lion>.*?</lion>").expect("lion pattern"),
        keystone_block: Regex::new(r"(?s)<keystone>.*?</keystone>").expect("keystone pattern"),
        riot_client_block: Regex::new(r"(?s)<riot_client>.*?</riot_client>")
            .expect("riot_client pattern"),
        message_body: Regex::new(r"(?s)<body>(.*?)</body>").expect("body pattern"),
    })
}

/// Rewrite an outbound presence fragment for the requested mode.
///
/// Lobby/room presence (a ` to=` attribute) is forwarded verbatim while
/// `connect_to_muc` is set, and `Online` is a pure pass-through: the client's
/// own presence goes out unchanged. For the hiding modes every `<show>` body
/// and the League `<st>` status become the mode's wire token, `<status>` text
/// is dropped, and the rich-presence game blocks are stripped (Mobile keeps a
/// husk of the League block so the mobile badge shows). The Valorant client
/// version is captured out of the block before it is removed so the fake
/// contact can later advertise a matching version.
pub fn rewrite_presence<'a>(
    chunk: &'a str,
    mode: PresenceMode,
    connect_to_muc: bool,
    cached_valorant_version: &mut Option<String>,
) -> Cow<'a, str> {
    if connect_to_muc && chunk.contains(" to=") {
        return Cow::Borrowed(chunk);
    }
    if mode == PresenceMode::Online {
        return Cow::Borrowed(chunk);
    }

    let p = patterns();
    let token = mode.wire_token();

    if cached_valorant_version.is_none() {
        if let Some(caps) = p.valorant_version.captures(chunk) {
            if let Some(version) = decode_valorant_version(&caps[1]) {
                debug!(version = %version, "captured Valorant client version");
                *cached_valorant_version = Some(version);
            }
        }
    }

    let rewritten = p
        .show
        .replace_all(chunk, format!("<show>{token}</show>"))
        .into_owned();
    let mut rewritten = p
        .games_league_st
        .replace_all(&rewritten, |caps: &regex::Captures<'_>| {
            format!("{}<st>{token}</st>", &caps[1])
        })
        .into_owned();

    rewritten = p.status.replace_all(&rewritten, "").into_owned();
    rewritten = match mode {
        PresenceMode::Mobile => p
            .league_block
            .replace_all(&rewritten, |caps: &regex::Captures<'_>| {
                // Keep the block but drop the rich-presence payload and map.
                let block = p.league_p.replace(&caps[0], "").into_owned();
                p.league_m.replace(&block, "").into_owned()
            })
            .into_owned(),
        _ => p.league_block.replace_all(&rewritten, "").into_owned(),
    };
    rewritten = p.valorant_block.replace_all(&rewritten, "").into_owned();
    rewritten = p.bacon_block.replace_all(&rewritten, "").into_owned();
    rewritten = p.lion_block.replace_all(&rewritten, "").into_owned();
    rewritten = p.keystone_block.replace_all(&rewritten, "").into_owned();
    rewritten = p.riot_client_block.replace_all(&rewritten, "").into_owned();

    Cow::Owned(rewritten)
}

/// Decode the base64 JSON payload of a Valorant game block and pull out
/// `partyPresenceData.partyClientVersion`. Any decode or parse failure is
/// silently ignored; the fake contact then advertises `"unknown"`.
fn decode_valorant_version(payload: &str) -> Option<String> {
    let raw = BASE64_STANDARD.decode(payload).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value
        .get("partyPresenceData")?
        .get("partyClientVersion")?
        .as_str()
        .map(|s| s.to_string())
}

/// Splice the fake contact's roster `<item>` into a roster query fragment.
///
/// Returns `None` when the fragment does not contain the roster open marker;
/// the chunk is then forwarded as-is.
pub fn inject_roster_item(chunk: &str) -> Option<String> {
    let idx = chunk.find(ROSTER_OPEN_MARKER)?;
    let splice_at = idx + ROSTER_OPEN_MARKER.len();
    let item = format!(
        "<item jid='{FAKE_JID}' name='{FAKE_NAME}' subscription='both' puuid='{FAKE_PUUID}'>\
         <group priority='9999'>Deceive</group>\
         <state>online</state>\
         <id name='{FAKE_NAME}' tagline='...'/>\
         <lol name='{FAKE_NAME}'/>\
         <platforms><riot name='\tDeceive Active' tagline='...'/></platforms>\
         </item>"
    );
    let mut out = String::with_capacity(chunk.len() + item.len());
    out.push_str(&chunk[..splice_at]);
    out.push_str(&item);
    out.push_str(&chunk[splice_at..]);
    Some(out)
}

/// Build the fake contact's initial presence, pushed to the client once its
/// roster entry is in place. The contact appears in-game everywhere at once
/// so it is visible no matter which Riot client the user launched.
pub fn fake_presence_stanza(cached_valorant_version: Option<&str>) -> String {
    let ts = Utc::now().timestamp_millis();
    let random_id = Uuid::new_v4();
    let valorant_presence = BASE64_STANDARD.encode(
        serde_json::json!({
            "isValid": true,
            "partyId": "00000000-0000-0000-0000-000000000000",
            "partyClientVersion": cached_valorant_version.unwrap_or("unknown"),
            "accountLevel": 1000,
        })
        .to_string(),
    );

    format!(
        "<presence from='{FAKE_JID}/{FAKE_RESOURCE}' id='b-{random_id}'>\
         <games>\
         <keystone><st>chat</st><s.t>{ts}</s.t><s.p>keystone</s.p></keystone>\
         <league_of_legends><st>chat</st><s.t>{ts}</s.t><s.p>league_of_legends</s.p><s.c>live</s.c><p>{{\"pty\":true}}</p></league_of_legends>\
         <valorant><st>chat</st><s.t>{ts}</s.t><s.p>valorant</s.p><s.r>PC</s.r><p>{valorant_presence}</p></valorant>\
         <bacon><st>chat</st><s.l>bacon_availability_online</s.l><s.t>{ts}</s.t><s.p>bacon</s.p></bacon>\
         </games>\
         <show>chat</show><platform>riot</platform><status/>\
         </presence>"
    )
}

/// Build a chat message from the fake contact to the user.
pub fn fake_message_stanza(text: &str) -> String {
    let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    format!(
        "<message from='{FAKE_JID}/{FAKE_RESOURCE}' stamp='{stamp}' id='fake-{stamp}' type='chat'>\
         <body>{text}</body>\
         </message>"
    )
}

/// Extract the `<body>` text from a message fragment addressed to the fake
/// contact.
pub fn extract_message_body(chunk: &str) -> Option<&str> {
    patterns()
        .message_body
        .captures(chunk)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Interpret a chat message to the fake contact as a command.
///
/// Matching is a case-insensitive substring check in a fixed priority order,
/// so "go offline please" works just as well as "offline".
pub fn parse_chat_command(body: &str) -> Option<ChatCommand> {
    const COMMANDS: [(&str, ChatCommand); 7] = [
        ("offline", ChatCommand::Offline),
        ("mobile", ChatCommand::Mobile),
        ("online", ChatCommand::Online),
        ("enable", ChatCommand::Enable),
        ("disable", ChatCommand::Disable),
        ("status", ChatCommand::Status),
        ("help", ChatCommand::Help),
    ];

    let lowered = body.to_ascii_lowercase();
    COMMANDS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|&(_, cmd)| cmd)
}
