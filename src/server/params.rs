// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server/params.rs - 请求检测参数
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

use serde_json::{Map, Value};

use crate::{ServeError, model::DetectionConfig};

const MIN_INFERENCE_SIZE: u32 = 32;
const MAX_INFERENCE_SIZE: u32 = 4096;

/// 客户端提交的原始检测参数，缺省或空值使用默认配置
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DetectionParams {
  pub conf: Option<String>,
  pub iou: Option<String>,
  pub imgsz: Option<String>,
}

impl DetectionParams {
  pub const FIELDS: [&'static str; 3] = ["conf", "iou", "imgsz"];

  pub fn accepts(name: &str) -> bool {
    Self::FIELDS.contains(&name)
  }

  /// 设置一个参数；不认识的参数名返回 `false`
  pub fn set(&mut self, name: &str, value: String) -> bool {
    let slot = match name {
      "conf" => &mut self.conf,
      "iou" => &mut self.iou,
      "imgsz" => &mut self.imgsz,
      _ => return false,
    };
    *slot = Some(value);
    true
  }

  /// 从 JSON 对象中读取参数，数字和数字字符串都可以接受
  pub fn from_json(object: &Map<String, Value>) -> Result<Self, ServeError> {
    let mut params = Self::default();
    for name in Self::FIELDS {
      let value = match object.get(name) {
        None | Some(Value::Null) => continue,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
          return Err(ServeError::invalid(
            name,
            format!("expected a number, got {}", other),
          ));
        }
      };
      params.set(name, value);
    }
    Ok(params)
  }

  pub fn into_config(self) -> Result<DetectionConfig, ServeError> {
    let defaults = DetectionConfig::default();
    Ok(DetectionConfig {
      confidence_threshold: parse_unit("conf", self.conf.as_deref())?
        .unwrap_or(defaults.confidence_threshold),
      iou_threshold: parse_unit("iou", self.iou.as_deref())?.unwrap_or(defaults.iou_threshold),
      inference_size: parse_size(self.imgsz.as_deref())?.unwrap_or(defaults.inference_size),
    })
  }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
  value.map(str::trim).filter(|v| !v.is_empty())
}

/// [0, 1] 区间内的阈值
fn parse_unit(name: &'static str, value: Option<&str>) -> Result<Option<f32>, ServeError> {
  let Some(value) = non_empty(value) else {
    return Ok(None);
  };
  let parsed: f32 = value
    .parse()
    .map_err(|_| ServeError::invalid(name, format!("'{}' is not a number", value)))?;
  if !parsed.is_finite() || !(0.0..=1.0).contains(&parsed) {
    return Err(ServeError::invalid(
      name,
      format!("{} is outside [0, 1]", parsed),
    ));
  }
  Ok(Some(parsed))
}

/// 推理尺寸，接受 `640` 与 `640.0` 这样的整数值
fn parse_size(value: Option<&str>) -> Result<Option<u32>, ServeError> {
  let Some(value) = non_empty(value) else {
    return Ok(None);
  };
  let parsed: f64 = value
    .parse()
    .map_err(|_| ServeError::invalid("imgsz", format!("'{}' is not a number", value)))?;
  if parsed.fract() != 0.0
    || parsed < MIN_INFERENCE_SIZE as f64
    || parsed > MAX_INFERENCE_SIZE as f64
  {
    return Err(ServeError::invalid(
      "imgsz",
      format!(
        "{} is not an integer in [{}, {}]",
        value, MIN_INFERENCE_SIZE, MAX_INFERENCE_SIZE
      ),
    ));
  }
  Ok(Some(parsed as u32))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn object(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => unreachable!(),
    }
  }

  #[test]
  fn defaults_when_absent_or_empty() {
    let mut params = DetectionParams::default();
    params.set("conf", "  ".to_string());
    assert_eq!(params.into_config().unwrap(), DetectionConfig::default());
  }

  #[test]
  fn parses_form_values() {
    let mut params = DetectionParams::default();
    assert!(params.set("conf", "0.5".into()));
    assert!(params.set("iou", "0.3".into()));
    assert!(params.set("imgsz", "320".into()));
    assert!(!params.set("other", "1".into()));
    assert!(DetectionParams::accepts("imgsz"));
    assert!(!DetectionParams::accepts("thumbnail"));

    let config = params.into_config().unwrap();
    assert_eq!(config.confidence_threshold, 0.5);
    assert_eq!(config.iou_threshold, 0.3);
    assert_eq!(config.inference_size, 320);
  }

  #[test]
  fn json_accepts_numbers_and_numeric_strings() {
    let params = DetectionParams::from_json(&object(json!({
      "conf": 0.4,
      "iou": "0.6",
      "imgsz": 1280,
      "url": "http://example.com/a.jpg"
    })))
    .unwrap();
    let config = params.into_config().unwrap();
    assert_eq!(config.confidence_threshold, 0.4);
    assert_eq!(config.iou_threshold, 0.6);
    assert_eq!(config.inference_size, 1280);
  }

  #[test]
  fn rejects_out_of_range_and_garbage() {
    let cases = [("conf", "1.5"), ("iou", "abc"), ("imgsz", "16"), ("imgsz", "640.5")];
    for (name, value) in cases {
      let mut params = DetectionParams::default();
      params.set(name, value.to_string());
      let err = params.into_config().unwrap_err();
      assert!(
        matches!(err, ServeError::InvalidParameter { name: n, .. } if n == name),
        "{} = {}",
        name,
        value
      );
    }
  }

  #[test]
  fn json_rejects_non_numeric_types() {
    let result = DetectionParams::from_json(&object(json!({ "conf": [0.5] })));
    assert!(matches!(
      result,
      Err(ServeError::InvalidParameter { name: "conf", .. })
    ));
  }
}
