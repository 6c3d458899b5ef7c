use anyhow::bail;

use lingua_sync::Draft;
use lingua_types::{ConversationId, MessageType, UserId};

pub const HELP: &str = "\
/list                    show conversations
/more                    load more conversations
/open <id>               open a conversation
/older                   load older messages
/read                    mark the open conversation read
/find <username|email>   look up a user id
/dm <userId>             start a direct conversation
/group <name> <u1,u2>    create a group
/rename <name>           rename the open conversation
/locale <code>           set the open conversation's locale
/add <u1,u2>             add members to the open conversation
/img|/video|/audio|/file <url>   send an attachment
/quit
anything else is sent as text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    More,
    Open(ConversationId),
    Older,
    Read,
    Find(String),
    Direct(UserId),
    Group { name: String, members: Vec<UserId> },
    Rename(String),
    Locale(String),
    Add(Vec<UserId>),
    Send(Draft),
    Help,
    Quit,
}

/// Parses one stdin line. Blank lines yield `None`.
pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(Draft::text(line))));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "list" => Command::List,
        "more" => Command::More,
        "open" => Command::Open(ConversationId::new(required(name, arg)?)),
        "older" => Command::Older,
        "read" => Command::Read,
        "find" => Command::Find(required(name, arg)?.to_string()),
        "dm" => Command::Direct(UserId::new(required(name, arg)?)),
        "group" => {
            let Some((group_name, members)) = arg.rsplit_once(char::is_whitespace) else {
                bail!("usage: /group <name> <user1,user2>");
            };
            Command::Group {
                name: group_name.trim().to_string(),
                members: user_list(members),
            }
        }
        "rename" => Command::Rename(required(name, arg)?.to_string()),
        "locale" => Command::Locale(required(name, arg)?.to_string()),
        "add" => Command::Add(user_list(required(name, arg)?)),
        "img" | "image" => Command::Send(Draft::attachment(MessageType::Image, required(name, arg)?)),
        "video" => Command::Send(Draft::attachment(MessageType::Video, required(name, arg)?)),
        "audio" => Command::Send(Draft::attachment(MessageType::Audio, required(name, arg)?)),
        "file" => Command::Send(Draft::attachment(MessageType::File, required(name, arg)?)),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command /{}, try /help", other),
    };
    Ok(Some(command))
}

fn required<'a>(command: &str, arg: &'a str) -> anyhow::Result<&'a str> {
    if arg.is_empty() {
        bail!("/{} needs an argument", command);
    }
    Ok(arg)
}

fn user_list(raw: &str) -> Vec<UserId> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(UserId::new)
        .collect()
}
