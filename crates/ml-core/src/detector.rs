use std::{convert::TryFrom, path::Path, time::Instant};

use anyhow::{Result, anyhow, bail};
use image::{RgbaImage, imageops::FilterType};
use tch::{self, Device, Kind, Tensor};

use crate::detection::{Detection, DetectorError, ObjectDetector, Prediction};

/// Class names of the 80-class COCO label set used by YOLO exports.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// TorchScript-backed detector running in-process.
///
/// The module must emit post-NMS rows of `[x1, y1, x2, y2, confidence, class]`
/// in input-tensor pixels; boxes are scaled back to the frame size.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (u32, u32),
    confidence_threshold: f32,
}

impl TorchDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(model_path: P, device: Device, input_size: (u32, u32)) -> Result<Self> {
        if input_size.0 == 0 || input_size.1 == 0 {
            bail!("detector input size must be positive, got {input_size:?}");
        }
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Resize an RGBA frame to the model input and build a normalised NCHW tensor.
    pub fn rgba_to_tensor(&self, frame: &RgbaImage) -> Result<Tensor> {
        let (in_w, in_h) = self.input_size;
        let resized;
        let pixels = if frame.dimensions() == self.input_size {
            frame
        } else {
            resized = image::imageops::resize(frame, in_w, in_h, FilterType::Triangle);
            &resized
        };

        let tensor = Tensor::from_slice(pixels.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h as i64, in_w as i64, 4])
            .narrow(3, 0, 3)
            .permute([0, 3, 1, 2])
            / 255.0;

        Ok(tensor)
    }

    /// Run the module and map surviving rows back into frame coordinates.
    pub fn infer(&self, input: &Tensor, frame_size: (u32, u32)) -> Result<Vec<Detection>> {
        let output = self.module.forward_ts(&[input])?;
        let preds = match output.size().as_slice() {
            [1, _, cols] if *cols >= 6 => output.squeeze_dim(0),
            [_, cols] if *cols >= 6 => output,
            shape => bail!("unexpected detector output shape: {shape:?}"),
        };

        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(
            &preds.to_device(Device::Cpu).to_kind(Kind::Float).contiguous(),
        )
        .map_err(|err| anyhow!("failed to read detector output: {err}"))?;

        let scale_x = frame_size.0 as f32 / self.input_size.0 as f32;
        let scale_y = frame_size.1 as f32 / self.input_size.1 as f32;

        let mut detections = Vec::new();
        for row in rows {
            let confidence = row[4];
            if confidence < self.confidence_threshold {
                continue;
            }
            let class_id = row[5] as i64;
            let class_name = usize::try_from(class_id)
                .ok()
                .and_then(|idx| COCO_CLASSES.get(idx))
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("class_{class_id}"));
            let bbox = [
                row[0] * scale_x,
                row[1] * scale_y,
                row[2] * scale_x,
                row[3] * scale_y,
            ];
            detections.push(Detection::new(class_id, class_name, confidence, bbox));
            if detections.len() >= 512 {
                break;
            }
        }

        Ok(detections)
    }
}

impl ObjectDetector for TorchDetector {
    fn detect(&mut self, frame: &RgbaImage) -> Result<Prediction, DetectorError> {
        let started = Instant::now();
        let input = self.rgba_to_tensor(frame)?;
        let detections = tch::no_grad(|| self.infer(&input, frame.dimensions()))?;
        Ok(Prediction {
            detections,
            took: started.elapsed(),
        })
    }

    fn backend(&self) -> &'static str {
        "torch"
    }
}
