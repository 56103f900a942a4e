mod common;

use common::synthetic::gaussian_blob;
use elastir::elastic::{Elastic, ElasticSettings};
use elastir::image::Image;
use elastir::map::DisplacementMap;
use elastir::mesh::Partitioning;
use elastir::workspace::WorkSpace;

fn image_2d(shape: [usize; 2], samples: &[f64]) -> Image {
    Image::from_samples([shape[0], shape[1], 1], samples, Partitioning::default()).unwrap()
}

fn pixel(x: usize, y: usize, nx: usize) -> usize {
    y * nx + x
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0f64, |m, &v| m.max(v.abs()))
}

#[test]
fn identical_images_converge_in_one_iteration() {
    let blob = gaussian_blob([32, 32], [16.0, 16.0], 3.0, 1.0);
    let mut fixed = image_2d([32, 32], &blob);
    let mut moved = image_2d([32, 32], &blob);
    fixed.normalize();
    moved.normalize();

    let mut registration =
        Elastic::new(&fixed, &moved, [8.0, 8.0, 1.0], ElasticSettings::default()).unwrap();
    registration.autoregister();

    // Spacing 8 on a 32-wide image admits no coarser generation.
    assert_eq!(registration.node_spacings().len(), 1);
    assert_eq!(registration.iteration_counts(), &[1]);
    assert!(
        max_abs(registration.map().coefficients()) < 0.01,
        "identity registration produced a displacement field"
    );
}

#[test]
fn translated_blob_displacement_is_recovered() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut fixed = image_2d([32, 32], &gaussian_blob([32, 32], [16.0, 16.0], 3.0, 1.0));
    let mut moved = image_2d([32, 32], &gaussian_blob([32, 32], [18.0, 16.0], 3.0, 1.0));
    fixed.normalize();
    moved.normalize();

    let mut registration =
        Elastic::new(&fixed, &moved, [4.0, 4.0, 1.0], ElasticSettings::default()).unwrap();
    registration.autoregister();

    assert!(*registration.iteration_counts().last().unwrap() <= 50);

    // The blob moved +2 pixels in x; the recovered displacement at the
    // fixed blob centre has to sample the moved blob.
    let p = pixel(16, 16, 32);
    let ux = registration.map().evaluate(0, p);
    let uy = registration.map().evaluate(1, p);
    assert!((ux - 2.0).abs() < 0.2, "ux = {ux}");
    assert!(uy.abs() < 0.2, "uy = {uy}");
}

#[test]
fn intensity_only_difference_produces_no_displacement() {
    // The moved image and a 2x-brighter copy of it. Mean normalisation
    // (always applied before registration, as in the standard pipeline)
    // removes the global scale, so no spatial displacement may be chased
    // and the joint solve has nothing left to attribute to either channel.
    let moved_samples = gaussian_blob([32, 32], [16.0, 16.0], 4.0, 1.0);
    let fixed_samples: Vec<f64> = moved_samples.iter().map(|v| 2.0 * v).collect();

    let mut fixed = image_2d([32, 32], &fixed_samples);
    let mut moved = image_2d([32, 32], &moved_samples);
    fixed.normalize();
    moved.normalize();

    let mut registration =
        Elastic::new(&fixed, &moved, [8.0, 8.0, 1.0], ElasticSettings::default()).unwrap();
    registration.autoregister();

    let map = registration.map();
    let nodes = map.node_count();
    let spatial = max_abs(&map.coefficients()[..2 * nodes]);
    assert!(spatial < 0.05, "spatial displacement crept in: {spatial}");

    // Nothing remains for the intensity channel either; the registered
    // image already matches the fixed one.
    let worst = registration
        .registered()
        .global()
        .iter()
        .zip(fixed.global())
        .fold(0.0f64, |m, (&a, &b)| m.max((a - b).abs()));
    assert!(worst < 1e-9, "registered image deviates by {worst}");
}

#[test]
fn two_dimensional_input_collapses_to_two_spatial_blocks() {
    let blob = gaussian_blob([16, 16], [8.0, 8.0], 3.0, 1.0);
    let mut image = image_2d([16, 16], &blob);
    image.normalize();

    assert_eq!(image.ndim(), 2);

    let map = DisplacementMap::new(&image, [4.0, 4.0, 1.0]).unwrap();
    let [mx, my, mz] = map.node_shape();
    assert_eq!(mz, 1);
    assert_eq!(map.coefficient_count(), 3 * mx * my);

    // No z gradient on a collapsed axis.
    let mut grad = vec![1.0; image.size()];
    image.gradient(2, &mut grad);
    assert!(grad.iter().all(|&g| g == 0.0));
}

#[test]
fn mismatched_shapes_never_reach_the_registrar() {
    let fixed = image_2d([16, 16], &vec![1.0; 256]);
    let moved = image_2d([16, 12], &vec![1.0; 192]);

    let err = Elastic::new(&fixed, &moved, [4.0, 4.0, 1.0], ElasticSettings::default());
    assert!(err.is_err());
}

#[test]
fn spacing_at_image_extent_runs_a_single_two_node_generation() {
    let blob = gaussian_blob([32, 32], [16.0, 16.0], 3.0, 1.0);
    let mut fixed = image_2d([32, 32], &blob);
    let mut moved = image_2d([32, 32], &blob);
    fixed.normalize();
    moved.normalize();

    let mut registration =
        Elastic::new(&fixed, &moved, [32.0, 32.0, 1.0], ElasticSettings::default()).unwrap();
    registration.autoregister();

    assert_eq!(registration.node_spacings().len(), 1);
    assert_eq!(registration.map().node_shape(), [2, 2, 1]);
}

#[test]
fn zero_map_warp_reproduces_the_moved_image_exactly() {
    let blob = gaussian_blob([24, 20], [10.0, 12.0], 4.0, 1.0);
    let moved = image_2d([24, 20], &blob);

    let map = DisplacementMap::new(&moved, [6.0, 5.0, 1.0]).unwrap();
    let mut ws = WorkSpace::allocate(&moved, &map);
    let warped = map.warp(&moved, &mut ws);

    assert_eq!(warped.global(), moved.global());
}

#[test]
fn constant_displacement_translates_samples() {
    let blob = gaussian_blob([32, 32], [16.0, 16.0], 4.0, 1.0);
    let moved = image_2d([32, 32], &blob);

    let mut map = DisplacementMap::new(&moved, [8.0, 8.0, 1.0]).unwrap();
    let mut delta = vec![0.0; map.coefficient_count()];
    delta[..map.node_count()].fill(2.0);
    map.update(&delta);

    let mut ws = WorkSpace::allocate(&moved, &map);
    let warped = map.warp(&moved, &mut ws);

    // Away from the clamped right edge the warp is an exact 2-pixel shift.
    for y in 0..32 {
        for x in 0..29 {
            let got = warped.global()[pixel(x, y, 32)];
            let want = moved.global()[pixel(x + 2, y, 32)];
            assert!((got - want).abs() < 1e-12, "({x}, {y}): {got} vs {want}");
        }
    }
}
