use nalgebra::Vector3;
use ndarray::Array2;

pub fn row_to_vector3(points: &Array2<f64>, idx: usize) -> Vector3<f64> {
    Vector3::new(points[[idx, 0]], points[[idx, 1]], points[[idx, 2]])
}

/// sub_row translates every point so that point `idx` lands on the origin.
pub fn sub_row(points: &Array2<f64>, idx: usize) -> Array2<f64> {
    let origin = points.row(idx).to_owned();
    points - &origin
}

pub fn array2_to_triples(points: &Array2<f64>) -> Vec<[f64; 3]> {
    points.rows().into_iter().map(|row| [row[0], row[1], row[2]]).collect()
}

pub fn array2_to_pairs(points: &Array2<f64>) -> Vec<[f64; 2]> {
    points.rows().into_iter().map(|row| [row[0], row[1]]).collect()
}
