// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 服务错误类型
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
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::{input::InputError, model::ModelError, output::OutputError, task::TaskError};

pub const NO_IMAGE: &str = "No image file provided";
pub const NO_URL: &str = "No URL provided";
pub const NO_VIDEO: &str = "No video file provided";

/// 客户端已断开时使用的状态码
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// 传输层错误，每个变体对应一种 HTTP 状态码
#[derive(Error, Debug)]
pub enum ServeError {
  #[error("{0}")]
  InputMissing(&'static str),
  #[error("invalid value for {name}: {reason}")]
  InvalidParameter { name: &'static str, reason: String },
  #[error("malformed request: {0}")]
  MalformedRequest(String),
  #[error("{0}")]
  DecodeFailure(#[from] InputError),
  #[error("{0}")]
  FetchFailure(String),
  #[error("{0}")]
  DetectorFailure(#[from] ModelError),
  #[error("{0}")]
  EncodeFailure(#[from] OutputError),
  #[error("request cancelled after {processed} frames")]
  Cancelled { processed: usize },
  #[error("internal error: {0}")]
  Internal(String),
}

impl From<TaskError> for ServeError {
  fn from(err: TaskError) -> Self {
    match err {
      TaskError::NoFrame => ServeError::Internal(err.to_string()),
      TaskError::Input(e) => ServeError::DecodeFailure(e),
      TaskError::Model(e) => ServeError::DetectorFailure(e),
      TaskError::Cancelled { processed } => ServeError::Cancelled { processed },
    }
  }
}

impl From<reqwest::Error> for ServeError {
  fn from(err: reqwest::Error) -> Self {
    ServeError::FetchFailure(err.to_string())
  }
}

impl ServeError {
  pub fn invalid(name: &'static str, reason: impl ToString) -> Self {
    ServeError::InvalidParameter {
      name,
      reason: reason.to_string(),
    }
  }

  pub fn status(&self) -> StatusCode {
    match self {
      ServeError::InputMissing(_)
      | ServeError::InvalidParameter { .. }
      | ServeError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
      ServeError::DecodeFailure(_)
      | ServeError::FetchFailure(_)
      | ServeError::DetectorFailure(_)
      | ServeError::EncodeFailure(_)
      | ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
      ServeError::Cancelled { .. } => {
        StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
      }
    }
  }
}

impl IntoResponse for ServeError {
  fn into_response(self) -> Response {
    let status = self.status();
    let message = self.to_string();
    if status.is_server_error() {
      error!("请求失败: {}", message);
    } else {
      warn!("请求无效: {}", message);
    }
    (status, Json(json!({ "error": message }))).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_input_is_bad_request_with_literal_message() {
    let err = ServeError::InputMissing(NO_IMAGE);
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.to_string(), "No image file provided");
  }

  #[test]
  fn failures_below_transport_are_server_errors() {
    let err = ServeError::from(TaskError::Model(ModelError::InferenceError("boom".into())));
    assert!(matches!(err, ServeError::DetectorFailure(_)));
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let err = ServeError::from(InputError::VideoDecodeError("bad".into()));
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
  }

  #[test]
  fn invalid_parameter_names_the_field() {
    let err = ServeError::invalid("conf", "expected a number");
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.to_string(), "invalid value for conf: expected a number");
  }

  #[test]
  fn cancelled_uses_client_closed_status() {
    let err = ServeError::from(TaskError::Cancelled { processed: 2 });
    assert_eq!(err.status().as_u16(), 499);
  }
}
