//! Conversion of remote attachments into local message content.

use std::sync::Arc;

use shared::{
    domain::ContentUri,
    local::{Intent, MediaInfo, MessageContent, MsgType},
    protocol::{DownloadedMedia, RemoteAttachment, RemoteMessage},
};
use tracing::debug;

use crate::{
    bridge::Bridge, collaborators::RemoteClient, error::AttachmentError, portal::Portal,
    user::UserAccount,
};

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedAttachment {
    pub content: MessageContent,
    /// False when the attachment already carries the message text.
    pub send_text: bool,
    /// Text the remote service embeds for this attachment, removed from the body.
    pub strip_from_text: Option<String>,
}

impl ConvertedAttachment {
    fn standalone(content: MessageContent) -> Self {
        Self {
            content,
            send_text: true,
            strip_from_text: None,
        }
    }
}

/// `Ok(None)` for attachments that need no event of their own.
pub(crate) async fn convert(
    portal: &Portal,
    source: &UserAccount,
    intent: &Intent,
    message: &RemoteMessage,
    attachment: &RemoteAttachment,
) -> Result<Option<ConvertedAttachment>, AttachmentError> {
    let kind = attachment.kind();
    let bridge = portal.bridge();
    match attachment {
        RemoteAttachment::Image { url } => {
            let client = session(source, kind).await?;
            let media = client
                .download(url)
                .await
                .map_err(|source| AttachmentError::Download { kind, source })?;
            let content = upload(bridge, intent, media, url, MsgType::Image, kind).await?;
            Ok(Some(ConvertedAttachment::standalone(content)))
        }
        RemoteAttachment::Video { url, .. } => {
            let client = session(source, kind).await?;
            let media = client
                .download(url)
                .await
                .map_err(|source| AttachmentError::Download { kind, source })?;
            let content = upload(bridge, intent, media, url, MsgType::Video, kind).await?;
            Ok(Some(ConvertedAttachment {
                content,
                send_text: true,
                strip_from_text: Some(url.clone()),
            }))
        }
        RemoteAttachment::File { file_id } => {
            let client = session(source, kind).await?;
            let media = client
                .download_file(portal.key(), file_id)
                .await
                .map_err(|source| AttachmentError::Download { kind, source })?;
            let mime_type = resolve_mime(&media, file_id);
            let msgtype = MsgType::for_mime(&mime_type);
            let content = upload(bridge, intent, media, file_id, msgtype, kind).await?;
            Ok(Some(ConvertedAttachment::standalone(content)))
        }
        RemoteAttachment::Location { name, lat, lng } => {
            let mut content =
                MessageContent::with_type(MsgType::Location, format!("Location: {name}\n{lat}, {lng}"));
            content.geo_uri = Some(format!("geo:{lat},{lng}"));
            Ok(Some(ConvertedAttachment::standalone(content)))
        }
        RemoteAttachment::Reply { reply_id } => {
            let target = match bridge.storage().get_message(portal.key(), reply_id).await {
                Ok(target) => target,
                Err(err) => {
                    debug!(portal = %portal.key(), %reply_id, "attachments: reply lookup failed: {err}");
                    None
                }
            };
            let Some(target) = target else {
                return Ok(None);
            };
            let mut content = MessageContent::text(message.text.clone());
            content.reply_to = Some(target.event_id);
            Ok(Some(ConvertedAttachment {
                content,
                send_text: false,
                strip_from_text: None,
            }))
        }
        RemoteAttachment::Mentions { .. } => Ok(None),
        RemoteAttachment::Unsupported => Err(AttachmentError::Unsupported(kind)),
    }
}

async fn session(
    source: &UserAccount,
    kind: &'static str,
) -> Result<Arc<dyn RemoteClient>, AttachmentError> {
    source.client().await.ok_or_else(|| AttachmentError::Download {
        kind,
        source: anyhow::anyhow!("{} is not logged in", source.local_user_id()),
    })
}

async fn upload(
    bridge: &Bridge,
    intent: &Intent,
    media: DownloadedMedia,
    name_hint: &str,
    msgtype: MsgType,
    kind: &'static str,
) -> Result<MessageContent, AttachmentError> {
    let mime_type = resolve_mime(&media, name_hint);
    let size = media.bytes.len() as u64;
    let body = media
        .filename
        .clone()
        .unwrap_or_else(|| file_name(name_hint).to_string());
    let uri = bridge
        .upload_with_retry(intent, media.bytes, &mime_type, Some(&body))
        .await
        .map_err(|source| AttachmentError::Upload { kind, source })?;
    let mut content = MessageContent::with_type(msgtype, body);
    content.url = Some(uri);
    content.info = Some(MediaInfo { mime_type, size });
    Ok(content)
}

/// Downloads a remote image and re-uploads it for use as an avatar.
pub(crate) async fn mirror_remote_image(
    bridge: &Bridge,
    client: &Arc<dyn RemoteClient>,
    intent: &Intent,
    url: &str,
) -> anyhow::Result<ContentUri> {
    let media = client.download(url).await?;
    let mime_type = resolve_mime(&media, url);
    let uri = bridge
        .upload_with_retry(intent, media.bytes, &mime_type, media.filename.as_deref())
        .await?;
    Ok(uri)
}

/// Reported type first, then a guess from the file name.
pub fn resolve_mime(media: &DownloadedMedia, name_hint: &str) -> String {
    if let Some(mime_type) = media.mime_type.as_deref().filter(|mime| !mime.is_empty()) {
        return mime_type.to_string();
    }
    let name = media.filename.as_deref().unwrap_or(name_hint);
    mime_guess::from_path(file_name(name))
        .first_raw()
        .unwrap_or(FALLBACK_MIME)
        .to_string()
}

fn file_name(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.rsplit('/').next().unwrap_or(path)
}
