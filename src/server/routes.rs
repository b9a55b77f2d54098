// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server/routes.rs - HTTP 检测接口
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

use axum::{
  Json,
  body::Bytes,
  extract::{
    Multipart, State,
    multipart::{MultipartError, MultipartRejection},
  },
  http::header,
  response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::{AppState, DetectionParams, run_blocking};
use crate::{
  ServeError,
  error::{NO_IMAGE, NO_URL, NO_VIDEO},
  input::{FrameSource, decode_image},
  model::DetectionConfig,
  task::{CancelFlag, OneShotTask, SamplingTask, Task, VideoAnalysisResult},
};

/// multipart 表单：一个文件字段加上检测参数
struct Form<F> {
  file: Option<F>,
  params: DetectionParams,
}

fn malformed(e: MultipartError) -> ServeError {
  ServeError::MalformedRequest(e.to_string())
}

/// 读取一个参数字段，未知字段忽略
async fn read_param(
  params: &mut DetectionParams,
  field: axum::extract::multipart::Field<'_>,
) -> Result<(), ServeError> {
  let Some(name) = field.name().map(String::from) else {
    return Ok(());
  };
  if !DetectionParams::accepts(&name) {
    debug!("忽略未知表单字段: {}", name);
    return Ok(());
  }
  let value = field.text().await.map_err(malformed)?;
  params.set(&name, value);
  Ok(())
}

async fn read_image_form(
  multipart: Result<Multipart, MultipartRejection>,
  file_field: &str,
  missing: &'static str,
) -> Result<Form<Bytes>, ServeError> {
  let mut multipart = multipart.map_err(|_| ServeError::InputMissing(missing))?;
  let mut form = Form {
    file: None,
    params: DetectionParams::default(),
  };

  while let Some(field) = multipart.next_field().await.map_err(malformed)? {
    if field.name() == Some(file_field) {
      let bytes = field.bytes().await.map_err(malformed)?;
      form.file = Some(bytes).filter(|b| !b.is_empty());
    } else {
      read_param(&mut form.params, field).await?;
    }
  }
  Ok(form)
}

/// 视频直接流式写入临时文件，文件在 `NamedTempFile` 被丢弃时删除
async fn read_video_form(
  multipart: Result<Multipart, MultipartRejection>,
  state: &AppState,
) -> Result<Form<NamedTempFile>, ServeError> {
  let mut multipart = multipart.map_err(|_| ServeError::InputMissing(NO_VIDEO))?;
  let mut form = Form {
    file: None,
    params: DetectionParams::default(),
  };

  while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
    if field.name() != Some("video") {
      read_param(&mut form.params, field).await?;
      continue;
    }

    let suffix = field
      .file_name()
      .and_then(|name| std::path::Path::new(name).extension())
      .and_then(|ext| ext.to_str())
      .map(|ext| format!(".{}", ext))
      .unwrap_or_default();
    let temp = tempfile::Builder::new()
      .prefix("shanan-upload-")
      .suffix(&suffix)
      .tempfile_in(&state.options.upload_dir)
      .map_err(|e| ServeError::Internal(format!("cannot create upload file: {}", e)))?;

    let mut out = tokio::fs::File::from_std(
      temp
        .reopen()
        .map_err(|e| ServeError::Internal(e.to_string()))?,
    );
    let mut written = 0usize;
    while let Some(chunk) = field.chunk().await.map_err(malformed)? {
      out
        .write_all(&chunk)
        .await
        .map_err(|e| ServeError::Internal(e.to_string()))?;
      written += chunk.len();
    }
    out
      .flush()
      .await
      .map_err(|e| ServeError::Internal(e.to_string()))?;
    debug!("视频已写入 {} ({} 字节)", temp.path().display(), written);

    form.file = Some(temp).filter(|_| written > 0);
  }
  Ok(form)
}

fn jpeg_response(bytes: Vec<u8>) -> Response {
  ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response()
}

/// 解码、检测并绘制单张图像
pub(crate) async fn annotate_bytes(
  state: &AppState,
  bytes: Vec<u8>,
  config: DetectionConfig,
  live: bool,
) -> Result<Vec<u8>, ServeError> {
  let detector = state.detector.clone();
  let annotator = state.annotator.clone();
  run_blocking(move || {
    let image = decode_image(&bytes)?;
    let source = if live {
      FrameSource::live_frame(image)
    } else {
      FrameSource::single_image(image)
    };
    let (frame, detections) = OneShotTask::new(config).run_task(source, detector.as_ref())?;
    Ok(annotator.annotate(&frame.image, &detections)?)
  })
  .await
}

pub async fn detect_image(
  State(state): State<AppState>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ServeError> {
  let form = read_image_form(multipart, "image", NO_IMAGE).await?;
  let bytes = form.file.ok_or(ServeError::InputMissing(NO_IMAGE))?;
  let config = form.params.into_config()?;
  info!("图像检测请求: {} 字节", bytes.len());

  let jpeg = annotate_bytes(&state, bytes.to_vec(), config, false).await?;
  Ok(jpeg_response(jpeg))
}

/// 请求体不是带 `url` 字段的 JSON 对象时一律视为缺少 URL
fn parse_url_request(body: &[u8]) -> Result<(String, DetectionParams), ServeError> {
  let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) else {
    return Err(ServeError::InputMissing(NO_URL));
  };
  let url = object
    .get("url")
    .and_then(Value::as_str)
    .map(str::trim)
    .filter(|url| !url.is_empty())
    .ok_or(ServeError::InputMissing(NO_URL))?
    .to_string();
  let params = DetectionParams::from_json(&object)?;
  Ok((url, params))
}

async fn fetch_image(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, ServeError> {
  let url = Url::parse(url)
    .map_err(|e| ServeError::FetchFailure(format!("invalid URL '{}': {}", url, e)))?;
  if !matches!(url.scheme(), "http" | "https") {
    return Err(ServeError::FetchFailure(format!(
      "unsupported URL scheme '{}'",
      url.scheme()
    )));
  }

  info!("下载图像: {}", url);
  let response = client.get(url).send().await?.error_for_status()?;
  let bytes = response.bytes().await?;
  Ok(bytes.to_vec())
}

pub async fn detect_url(State(state): State<AppState>, body: Bytes) -> Result<Response, ServeError> {
  let (url, params) = parse_url_request(&body)?;
  let config = params.into_config()?;
  let bytes = fetch_image(&state.http, &url).await?;

  let jpeg = annotate_bytes(&state, bytes, config, false).await?;
  Ok(jpeg_response(jpeg))
}

pub async fn detect_video(
  State(state): State<AppState>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VideoAnalysisResult>, ServeError> {
  let form = read_video_form(multipart, &state).await?;
  let file = form.file.ok_or(ServeError::InputMissing(NO_VIDEO))?;
  let config = form.params.into_config()?;

  // 客户端断开时处理函数被丢弃，守卫随之取消采样任务
  let cancel = CancelFlag::new();
  let guard = cancel.guard();

  let detector = state.detector.clone();
  let video = state.video.clone();
  let period = state.options.sample_period_sec;
  let result = run_blocking(move || {
    let outcome = FrameSource::sampled_video(video.as_ref(), file.path(), period)
      .map_err(ServeError::from)
      .and_then(|source| {
        SamplingTask::new(config)
          .with_cancel(cancel)
          .run_task(source, detector.as_ref())
          .map_err(ServeError::from)
      });
    if let Err(e) = file.close() {
      debug!("删除临时文件失败: {}", e);
    }
    outcome
  })
  .await;
  guard.disarm();

  let result = result?;
  info!("视频检测完成: {} 个采样帧", result.frames.len());
  Ok(Json(result))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
  Json(json!({ "status": "ok", "detector": state.detector.name() }))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_request_requires_url() {
    let bodies: [&[u8]; 6] = [b"", b"not json", b"[]", b"{}", b"{\"url\": \"  \"}", b"{\"url\": 3}"];
    for body in bodies {
      assert!(matches!(
        parse_url_request(body),
        Err(ServeError::InputMissing(NO_URL))
      ));
    }
  }

  #[test]
  fn url_request_carries_params() {
    let (url, params) =
      parse_url_request(br#"{"url": "http://host/a.jpg", "conf": "0.7"}"#).unwrap();
    assert_eq!(url, "http://host/a.jpg");
    assert_eq!(params.conf.as_deref(), Some("0.7"));
  }

  #[tokio::test]
  async fn fetch_rejects_invalid_urls() {
    let client = reqwest::Client::new();
    assert!(matches!(
      fetch_image(&client, "not a url").await,
      Err(ServeError::FetchFailure(_))
    ));
    assert!(matches!(
      fetch_image(&client, "file:///etc/passwd").await,
      Err(ServeError::FetchFailure(_))
    ));
  }
}
