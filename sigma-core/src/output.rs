//! Pipeline output shapes and the image extractor.
//!
//! A pipeline is free to return its images in whichever layout its backend
//! produces: a record with an `images` field, a bare list, a tuple-like list
//! whose first element holds the images, or something nested deeper. The
//! extractor walks these shapes in a fixed order and hands back every image
//! it can find, in generation order.

use std::collections::BTreeMap;

use candle_core::{IndexOp, Tensor};
use image::DynamicImage;

/// How deep [`extract_images`] descends when nothing matched at the surface.
pub const MAX_SEARCH_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub enum PipelineOutput {
    Image(DynamicImage),
    Tensor(Tensor),
    List(Vec<PipelineOutput>),
    Record(BTreeMap<String, PipelineOutput>),
    Value(serde_json::Value),
}

impl PipelineOutput {
    /// Record with a single `images` list, the shape the bundled pipeline returns.
    pub fn images(images: Vec<PipelineOutput>) -> Self {
        let mut record = BTreeMap::new();
        record.insert("images".to_string(), PipelineOutput::List(images));
        PipelineOutput::Record(record)
    }

    fn is_image_like(&self, trust: Trust) -> bool {
        match self {
            PipelineOutput::Image(_) => true,
            PipelineOutput::Tensor(tensor) => trust.accepts(tensor),
            _ => false,
        }
    }

    fn as_image_list(&self, trust: Trust) -> Option<&[PipelineOutput]> {
        match self {
            PipelineOutput::List(items) if items.first().is_some_and(|i| i.is_image_like(trust)) => {
                Some(items)
            }
            _ => None,
        }
    }
}

/// An image located in pipeline output, not yet converted to RGB.
#[derive(Debug, Clone)]
pub enum RawImage {
    Decoded(DynamicImage),
    Pixels(Tensor),
}

/// Smallest height and width a tensor found outside an `images` field may have.
const MIN_SPATIAL: usize = 8;

/// How much a tensor has to look like pixels before it is taken as an image.
#[derive(Debug, Clone, Copy)]
enum Trust {
    /// Found under an `images` field: any plausible layout is accepted.
    Declared,
    /// Found anywhere else: colour planes and a real spatial extent are required.
    Guessed,
}

impl Trust {
    fn accepts(self, tensor: &Tensor) -> bool {
        match self {
            Trust::Declared => is_image_tensor(tensor),
            Trust::Guessed => is_pixel_tensor(tensor),
        }
    }
}

pub(crate) fn is_channel_count(dim: usize) -> bool {
    matches!(dim, 1 | 3 | 4)
}

fn is_image_tensor(tensor: &Tensor) -> bool {
    let dims = tensor.dims();
    match dims.len() {
        2 => dims.iter().all(|&d| d > 0),
        3 => is_channel_count(dims[0]) || is_channel_count(dims[2]),
        4 => dims[0] > 0 && (is_channel_count(dims[1]) || is_channel_count(dims[3])),
        _ => false,
    }
}

/// RGB(A) planes, first or last, around at least `MIN_SPATIAL` pixels per side.
fn is_pixel_tensor(tensor: &Tensor) -> bool {
    let dims = tensor.dims();
    let image = match dims.len() {
        3 => dims,
        4 if dims[0] > 0 => &dims[1..],
        _ => return false,
    };
    let (height, width) = match image {
        [c, h, w] if matches!(*c, 3 | 4) => (*h, *w),
        [h, w, c] if matches!(*c, 3 | 4) => (*h, *w),
        _ => return false,
    };
    height >= MIN_SPATIAL && width >= MIN_SPATIAL
}

/// Turns one image-like node into raw images, splitting batched tensors.
fn collect(node: &PipelineOutput, trust: Trust, out: &mut Vec<RawImage>) {
    match node {
        PipelineOutput::Image(img) => out.push(RawImage::Decoded(img.clone())),
        PipelineOutput::Tensor(tensor) if trust.accepts(tensor) => {
            let batch = if tensor.rank() == 4 { tensor.dim(0).unwrap_or(1) } else { 1 };
            if batch > 1 {
                for index in 0..batch {
                    match tensor.i(index) {
                        Ok(item) => out.push(RawImage::Pixels(item)),
                        Err(e) => tracing::warn!("skipping batch item {index}: {e}"),
                    }
                }
            } else {
                out.push(RawImage::Pixels(tensor.clone()));
            }
        }
        _ => {}
    }
}

fn collect_all(items: &[PipelineOutput], trust: Trust) -> Vec<RawImage> {
    let mut out = Vec::new();
    for item in items {
        collect(item, trust, &mut out);
    }
    out
}

/// Images held directly by a node: itself, or the elements of an image list.
fn images_in(node: &PipelineOutput, trust: Trust) -> Vec<RawImage> {
    if let Some(items) = node.as_image_list(trust) {
        return collect_all(items, trust);
    }
    let mut out = Vec::new();
    collect(node, trust, &mut out);
    out
}

fn search(node: &PipelineOutput, depth: usize) -> Vec<RawImage> {
    let found = images_in(node, Trust::Guessed);
    if !found.is_empty() || depth == 0 {
        return found;
    }
    let children: Box<dyn Iterator<Item = &PipelineOutput>> = match node {
        PipelineOutput::List(items) => Box::new(items.iter()),
        PipelineOutput::Record(fields) => Box::new(fields.values()),
        _ => return Vec::new(),
    };
    for child in children {
        let found = search(child, depth - 1);
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

/// Locates the generated images inside `output`.
///
/// Strategies, first match wins:
/// 1. a record field named `images`;
/// 2. a list whose first element is an image;
/// 3. a list whose first element is itself such a list;
/// 4. a depth-first search bounded by [`MAX_SEARCH_DEPTH`].
///
/// Raw tensors under `images` only need a plausible layout. Everywhere else
/// they must carry RGB(A) planes, so embeddings and masks are not mistaken for
/// pictures.
///
/// Returns an empty vector when no image could be located.
pub fn extract_images(output: &PipelineOutput) -> Vec<RawImage> {
    if let PipelineOutput::Record(fields) = output {
        if let Some(images) = fields.get("images") {
            let found = images_in(images, Trust::Declared);
            if !found.is_empty() {
                return found;
            }
        }
    }

    if let Some(items) = output.as_image_list(Trust::Guessed) {
        return collect_all(items, Trust::Guessed);
    }

    if let PipelineOutput::List(items) = output {
        if let Some(items) = items.first().and_then(|i| i.as_image_list(Trust::Guessed)) {
            return collect_all(items, Trust::Guessed);
        }
    }

    search(output, MAX_SEARCH_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use image::{Rgb, RgbImage};

    fn solid(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([value, value, value])))
    }

    fn decoded_values(images: &[RawImage]) -> Vec<u8> {
        images
            .iter()
            .map(|img| match img {
                RawImage::Decoded(img) => img.to_rgb8().get_pixel(0, 0)[0],
                RawImage::Pixels(_) => panic!("expected decoded image"),
            })
            .collect()
    }

    #[test]
    fn test_images_field_returned_unchanged() {
        let output = PipelineOutput::images(vec![
            PipelineOutput::Image(solid(10)),
            PipelineOutput::Image(solid(20)),
            PipelineOutput::Image(solid(30)),
        ]);
        let images = extract_images(&output);
        assert_eq!(decoded_values(&images), vec![10, 20, 30]);
    }

    #[test]
    fn test_bare_list_of_images() {
        let output = PipelineOutput::List(vec![
            PipelineOutput::Image(solid(1)),
            PipelineOutput::Image(solid(2)),
        ]);
        assert_eq!(decoded_values(&extract_images(&output)), vec![1, 2]);
    }

    #[test]
    fn test_tuple_style_output() {
        let output = PipelineOutput::List(vec![
            PipelineOutput::List(vec![PipelineOutput::Image(solid(5))]),
            PipelineOutput::Value(serde_json::json!([false])),
        ]);
        assert_eq!(decoded_values(&extract_images(&output)), vec![5]);
    }

    #[test]
    fn test_nested_search_finds_images() {
        let mut inner = BTreeMap::new();
        inner.insert("frames".to_string(), PipelineOutput::List(vec![PipelineOutput::Image(solid(9))]));
        let mut outer = BTreeMap::new();
        outer.insert("meta".to_string(), PipelineOutput::Value(serde_json::json!({"ok": true})));
        outer.insert("result".to_string(), PipelineOutput::Record(inner));
        let output = PipelineOutput::Record(outer);
        assert_eq!(decoded_values(&extract_images(&output)), vec![9]);
    }

    #[test]
    fn test_search_depth_is_bounded() {
        let mut node = PipelineOutput::Image(solid(3));
        for _ in 0..=MAX_SEARCH_DEPTH {
            let mut record = BTreeMap::new();
            record.insert("inner".to_string(), node);
            node = PipelineOutput::Record(record);
        }
        assert!(extract_images(&node).is_empty());
    }

    #[test]
    fn test_no_images_yields_empty() {
        let mut record = BTreeMap::new();
        record.insert("images".to_string(), PipelineOutput::List(Vec::new()));
        record.insert("nsfw".to_string(), PipelineOutput::Value(serde_json::json!([false])));
        assert!(extract_images(&PipelineOutput::Record(record)).is_empty());
        assert!(extract_images(&PipelineOutput::Value(serde_json::Value::Null)).is_empty());
    }

    #[test]
    fn test_batched_tensor_is_split() -> candle_core::Result<()> {
        let batch = Tensor::zeros((3, 3, 8, 8), DType::F32, &Device::Cpu)?;
        let images = extract_images(&PipelineOutput::images(vec![PipelineOutput::Tensor(batch)]));
        assert_eq!(images.len(), 3);
        for image in images {
            match image {
                RawImage::Pixels(t) => assert_eq!(t.dims(), &[3, 8, 8]),
                RawImage::Decoded(_) => panic!("expected tensor"),
            }
        }
        Ok(())
    }

    #[test]
    fn test_embedding_beside_empty_images_is_not_an_image() -> candle_core::Result<()> {
        let mut record = BTreeMap::new();
        record.insert("images".to_string(), PipelineOutput::List(Vec::new()));
        record.insert(
            "prompt_embeds".to_string(),
            PipelineOutput::Tensor(Tensor::zeros((1, 77, 64), DType::F32, &Device::Cpu)?),
        );
        assert!(extract_images(&PipelineOutput::Record(record)).is_empty());

        let mask = PipelineOutput::Tensor(Tensor::zeros((64, 64), DType::F32, &Device::Cpu)?);
        assert!(extract_images(&PipelineOutput::List(vec![mask])).is_empty());
        Ok(())
    }

    #[test]
    fn test_pixel_tensors_found_outside_images_field() -> candle_core::Result<()> {
        let rgb = Tensor::zeros((3, 32, 16), DType::F32, &Device::Cpu)?;
        let mut inner = BTreeMap::new();
        inner.insert("sample".to_string(), PipelineOutput::Tensor(rgb));
        let output = PipelineOutput::List(vec![PipelineOutput::Record(inner)]);
        assert_eq!(extract_images(&output).len(), 1);

        let tiny = Tensor::zeros((3, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(extract_images(&PipelineOutput::List(vec![PipelineOutput::Tensor(tiny)])).is_empty());
        Ok(())
    }

    #[test]
    fn test_grey_tensor_accepted_under_images_field() -> candle_core::Result<()> {
        let grey = Tensor::zeros((16, 16), DType::F32, &Device::Cpu)?;
        let output = PipelineOutput::images(vec![PipelineOutput::Tensor(grey)]);
        assert_eq!(extract_images(&output).len(), 1);
        Ok(())
    }

    #[test]
    fn test_non_image_tensor_is_ignored() -> candle_core::Result<()> {
        let embedding = Tensor::zeros((1, 77, 768, 2), DType::F32, &Device::Cpu)?;
        let output = PipelineOutput::List(vec![PipelineOutput::Tensor(embedding)]);
        assert!(extract_images(&output).is_empty());
        Ok(())
    }
}
