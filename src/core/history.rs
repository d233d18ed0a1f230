//! Approximate US annual total returns, 1974–2023.
//!
//! Read-only after compilation; every return model samples from these rows
//! without copying or mutating them.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoricalYear {
    pub year: i32,
    pub stocks: f64,
    pub bonds: f64,
    pub cash: f64,
    pub inflation: f64,
}

const fn row(year: i32, stocks: f64, bonds: f64, cash: f64, inflation: f64) -> HistoricalYear {
    HistoricalYear {
        year,
        stocks,
        bonds,
        cash,
        inflation,
    }
}

pub static ANNUAL_RETURNS: [HistoricalYear; 50] = [
    row(1974, -0.259, 0.0199, 0.078, 0.123),
    row(1975, 0.370, 0.0361, 0.060, 0.069),
    row(1976, 0.238, 0.1598, 0.050, 0.049),
    row(1977, -0.070, 0.0129, 0.053, 0.067),
    row(1978, 0.065, -0.0078, 0.072, 0.090),
    row(1979, 0.185, 0.0067, 0.100, 0.133),
    row(1980, 0.317, -0.0299, 0.114, 0.125),
    row(1981, -0.047, 0.0820, 0.140, 0.089),
    row(1982, 0.204, 0.3281, 0.106, 0.038),
    row(1983, 0.223, 0.0320, 0.086, 0.038),
    row(1984, 0.061, 0.1373, 0.095, 0.039),
    row(1985, 0.312, 0.2571, 0.075, 0.038),
    row(1986, 0.185, 0.2428, 0.060, 0.011),
    row(1987, 0.058, -0.0496, 0.058, 0.044),
    row(1988, 0.165, 0.0822, 0.067, 0.044),
    row(1989, 0.315, 0.1769, 0.081, 0.046),
    row(1990, -0.031, 0.0624, 0.075, 0.061),
    row(1991, 0.302, 0.1500, 0.054, 0.031),
    row(1992, 0.075, 0.0936, 0.034, 0.029),
    row(1993, 0.100, 0.1421, 0.030, 0.027),
    row(1994, 0.013, -0.0804, 0.043, 0.027),
    row(1995, 0.372, 0.2348, 0.055, 0.025),
    row(1996, 0.227, 0.0143, 0.050, 0.033),
    row(1997, 0.331, 0.0994, 0.051, 0.017),
    row(1998, 0.283, 0.1492, 0.048, 0.016),
    row(1999, 0.209, -0.0825, 0.046, 0.027),
    row(2000, -0.090, 0.1666, 0.058, 0.034),
    row(2001, -0.119, 0.0557, 0.034, 0.016),
    row(2002, -0.220, 0.1512, 0.016, 0.024),
    row(2003, 0.284, 0.0038, 0.010, 0.019),
    row(2004, 0.107, 0.0449, 0.014, 0.033),
    row(2005, 0.048, 0.0287, 0.032, 0.034),
    row(2006, 0.156, 0.0196, 0.047, 0.025),
    row(2007, 0.055, 0.1021, 0.044, 0.041),
    row(2008, -0.366, 0.2010, 0.014, 0.001),
    row(2009, 0.259, -0.1112, 0.0015, 0.027),
    row(2010, 0.148, 0.0846, 0.0014, 0.015),
    row(2011, 0.021, 0.1604, 0.0005, 0.030),
    row(2012, 0.159, 0.0297, 0.0009, 0.017),
    row(2013, 0.322, -0.0910, 0.0006, 0.015),
    row(2014, 0.135, 0.1075, 0.0003, 0.008),
    row(2015, 0.014, 0.0128, 0.0005, 0.007),
    row(2016, 0.118, 0.0069, 0.0032, 0.021),
    row(2017, 0.216, 0.0280, 0.0093, 0.021),
    row(2018, -0.042, -0.0002, 0.0194, 0.019),
    row(2019, 0.312, 0.0964, 0.0206, 0.023),
    row(2020, 0.180, 0.1133, 0.0035, 0.014),
    row(2021, 0.285, -0.0442, 0.0005, 0.070),
    row(2022, -0.180, -0.1783, 0.0202, 0.065),
    row(2023, 0.261, 0.0388, 0.0507, 0.034),
];
