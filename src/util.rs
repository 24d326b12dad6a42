// 小数点以下 digits 桁で丸める
pub fn round_to(value: f64, digits: i32) -> f64 {
    let pow = 10f64.powi(digits);
    (value * pow).round() / pow
}

/// Order quantities and prices are sent with two decimals.
pub fn round_size(size: f64) -> f64 {
    round_to(size, 2)
}
