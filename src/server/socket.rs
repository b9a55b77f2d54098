// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server/socket.rs - WebSocket 实时帧检测
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 每条二进制消息是一个 `frame` 事件：
//!
//! ```text
//! +----------------+-----------------------+-------------+
//! | u32 BE 头长度 N | N 字节 JSON 参数（可空） | JPEG 帧数据 |
//! +----------------+-----------------------+-------------+
//! ```
//!
//! 成功时回复一条二进制消息（`annotated_frame`，绘制后的 JPEG），
//! 失败时回复文本消息 `{"event":"error","data":{"message":...}}`。
//! 同一连接上的事件按顺序逐个处理。

use axum::{
  extract::{
    State,
    ws::{Message, WebSocket, WebSocketUpgrade},
  },
  response::IntoResponse,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{AppState, DetectionParams, routes::annotate_bytes};
use crate::{ServeError, error::NO_IMAGE};

const HEADER_LEN_BYTES: usize = 4;

/// 解码后的 `frame` 事件
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEvent {
  pub params: DetectionParams,
  pub image: Vec<u8>,
}

pub fn decode_frame_event(data: &[u8]) -> Result<FrameEvent, ServeError> {
  let Some((len, rest)) = data.split_first_chunk::<HEADER_LEN_BYTES>() else {
    return Err(ServeError::MalformedRequest(format!(
      "frame event shorter than {} byte header length",
      HEADER_LEN_BYTES
    )));
  };
  let header_len = u32::from_be_bytes(*len) as usize;
  if rest.len() < header_len {
    return Err(ServeError::MalformedRequest(format!(
      "frame header declares {} bytes, only {} available",
      header_len,
      rest.len()
    )));
  }

  let (header, image) = rest.split_at(header_len);
  let params = if header.is_empty() {
    DetectionParams::default()
  } else {
    match serde_json::from_slice::<Value>(header) {
      Ok(Value::Object(object)) => DetectionParams::from_json(&object)?,
      Ok(_) => {
        return Err(ServeError::MalformedRequest(
          "frame header must be a JSON object".to_string(),
        ));
      }
      Err(e) => {
        return Err(ServeError::MalformedRequest(format!(
          "invalid frame header: {}",
          e
        )));
      }
    }
  };

  if image.is_empty() {
    return Err(ServeError::InputMissing(NO_IMAGE));
  }

  Ok(FrameEvent {
    params,
    image: image.to_vec(),
  })
}

/// 构造 `frame` 事件，供客户端与测试使用
pub fn encode_frame_event(params: Option<&Value>, image: &[u8]) -> Vec<u8> {
  let header = params.map(Value::to_string).unwrap_or_default();
  let mut data = Vec::with_capacity(HEADER_LEN_BYTES + header.len() + image.len());
  data.extend_from_slice(&(header.len() as u32).to_be_bytes());
  data.extend_from_slice(header.as_bytes());
  data.extend_from_slice(image);
  data
}

fn error_event(message: &str) -> Message {
  Message::Text(json!({ "event": "error", "data": { "message": message } }).to_string())
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
  ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_frame_event(state: &AppState, data: &[u8]) -> Result<Vec<u8>, ServeError> {
  let event = decode_frame_event(data)?;
  let config = event.params.into_config()?;
  annotate_bytes(state, event.image, config, true).await
}

/// 处理一条消息，返回需要回复的消息；控制帧不回复
pub(crate) async fn reply(state: &AppState, message: Message) -> Option<Message> {
  match message {
    Message::Binary(data) => match handle_frame_event(state, &data).await {
      Ok(jpeg) => Some(Message::Binary(jpeg)),
      Err(e) => {
        warn!("帧处理失败: {}", e);
        Some(error_event(&e.to_string()))
      }
    },
    Message::Text(_) => Some(error_event(
      "unsupported text message; send binary frame events",
    )),
    Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
  }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
  info!("WebSocket 连接建立");
  let mut handled = 0usize;

  while let Some(message) = socket.recv().await {
    let message = match message {
      Ok(Message::Close(_)) => break,
      Ok(message) => message,
      Err(e) => {
        warn!("WebSocket 接收失败: {}", e);
        break;
      }
    };

    let Some(response) = reply(&state, message).await else {
      continue;
    };
    if matches!(response, Message::Binary(_)) {
      handled += 1;
      debug!("第 {} 帧处理完成", handled);
    }

    if let Err(e) = socket.send(response).await {
      warn!("WebSocket 发送失败: {}", e);
      break;
    }
  }

  info!("WebSocket 连接关闭，共处理 {} 帧", handled);
}

#[cfg(test)]
mod tests {
  use std::{io::Cursor, sync::Arc};

  use image::{ImageFormat, Rgb, RgbImage};

  use super::*;
  use crate::model::{Detection, ScriptedDetector};

  fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([30, 140, 200]));
    let mut bytes = Vec::new();
    image
      .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
      .unwrap();
    bytes
  }

  fn state() -> (AppState, Arc<ScriptedDetector>) {
    let detector = Arc::new(ScriptedDetector::new(vec![Detection::new(
      0,
      "person",
      0.9,
      [2.0, 2.0, 20.0, 20.0],
    )]));
    (AppState::new(detector.clone()), detector)
  }

  fn error_message(message: Option<Message>) -> String {
    let text = match message {
      Some(Message::Text(text)) => text,
      other => panic!("expected a text error event, got {:?}", other),
    };
    let event: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(event["event"], "error");
    event["data"]["message"].as_str().unwrap().to_string()
  }

  #[tokio::test]
  async fn frame_event_gets_annotated_jpeg() {
    let (state, detector) = state();
    let data = encode_frame_event(Some(&json!({ "conf": 0.5 })), &jpeg(48, 32));

    let Some(Message::Binary(annotated)) = reply(&state, Message::Binary(data)).await else {
      panic!("expected a binary annotated frame");
    };
    let decoded = image::load_from_memory(&annotated).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (48, 32));
    assert_eq!(detector.calls(), 1);
  }

  #[tokio::test]
  async fn events_are_answered_in_order() {
    let (state, detector) = state();
    let sizes = [(16, 16), (40, 24), (24, 40)];

    for (width, height) in sizes {
      let data = encode_frame_event(None, &jpeg(width, height));
      let Some(Message::Binary(annotated)) = reply(&state, Message::Binary(data)).await else {
        panic!("expected a binary annotated frame");
      };
      let decoded = image::load_from_memory(&annotated).unwrap();
      assert_eq!((decoded.width(), decoded.height()), (width, height));
    }
    assert_eq!(detector.calls(), sizes.len());
  }

  #[tokio::test]
  async fn corrupt_frame_gets_error_event() {
    let (state, detector) = state();
    let data = encode_frame_event(None, b"\xFF\xD8 not really a jpeg");

    let message = error_message(reply(&state, Message::Binary(data)).await);
    assert!(!message.is_empty());
    assert_eq!(detector.calls(), 0);
  }

  #[tokio::test]
  async fn invalid_params_and_text_get_error_events() {
    let (state, _) = state();
    let data = encode_frame_event(Some(&json!({ "iou": 3 })), &jpeg(8, 8));
    let message = error_message(reply(&state, Message::Binary(data)).await);
    assert!(message.starts_with("invalid value for iou"), "{}", message);

    let message = error_message(reply(&state, Message::Text("hello".to_string())).await);
    assert!(message.contains("text message"), "{}", message);
  }

  #[tokio::test]
  async fn control_frames_get_no_reply() {
    let (state, _) = state();
    assert!(reply(&state, Message::Ping(vec![1])).await.is_none());
    assert!(reply(&state, Message::Pong(Vec::new())).await.is_none());
  }

  #[test]
  fn frame_event_with_params() {
    let params = json!({ "conf": 0.6 });
    let data = encode_frame_event(Some(&params), b"\xFF\xD8jpeg");
    let event = decode_frame_event(&data).unwrap();
    assert_eq!(event.params.conf.as_deref(), Some("0.6"));
    assert_eq!(event.image, b"\xFF\xD8jpeg");
  }

  #[test]
  fn frame_event_without_header() {
    let data = encode_frame_event(None, b"abc");
    assert_eq!(&data[..4], &[0, 0, 0, 0]);
    let event = decode_frame_event(&data).unwrap();
    assert_eq!(event.params, DetectionParams::default());
  }

  #[test]
  fn truncated_events_are_malformed() {
    assert!(matches!(
      decode_frame_event(&[0, 0]),
      Err(ServeError::MalformedRequest(_))
    ));
    assert!(matches!(
      decode_frame_event(&[0, 0, 0, 10, b'{']),
      Err(ServeError::MalformedRequest(_))
    ));
  }

  #[test]
  fn header_must_be_object() {
    let mut data = vec![0, 0, 0, 2];
    data.extend_from_slice(b"[]jpeg");
    assert!(matches!(
      decode_frame_event(&data),
      Err(ServeError::MalformedRequest(_))
    ));
  }

  #[test]
  fn empty_image_is_missing_input() {
    let data = encode_frame_event(Some(&json!({})), b"");
    assert!(matches!(
      decode_frame_event(&data),
      Err(ServeError::InputMissing(NO_IMAGE))
    ));
  }
}
