use vizor_camera::{LensFacing, Rotation, YuvFrame, YuvLayout};
use vizor_preprocess::{yuv_to_rgba, Frame, FrameNormalizer, Preprocessor};

#[test]
fn cpu_smoke() -> anyhow::Result<()> {
    // White NV21 640×480 off a back camera mounted at 90°
    let yuv = YuvFrame::filled(YuvLayout::Nv21, 640, 480, 255, 128, 128);
    let rgba = yuv_to_rgba(&yuv)?;
    drop(yuv);

    let normalizer = FrameNormalizer::for_camera(Rotation::Deg90, LensFacing::Back);
    let upright = normalizer.detection(rgba.clone());
    assert_eq!(upright.dimensions(), (480, 640));
    assert_eq!(normalizer.display(rgba).dimensions(), (480, 480));

    let pp = Preprocessor::new(224, 224);
    let out = pp.run(&Frame::from_rgba(upright))?;
    assert_eq!(out.shape(), &[1, 3, 224, 224]);
    assert!(out.iter().all(|v| *v > 0.99));
    Ok(())
}
