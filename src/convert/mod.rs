pub mod container_disk;
pub mod qemu_img;
