mod bit_array;

pub use bit_array::BitArray;
