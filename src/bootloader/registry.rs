use std::sync::LazyLock;

use super::BootloaderProvider;
use super::grub_bios::GrubBiosProvider;
use super::grub_efi::GrubEfiProvider;
use super::grub_hybrid::GrubHybridProvider;
use super::syslinux::SyslinuxProvider;
use crate::image::error::ConfigError;

pub struct BootloaderRegistry {
    providers: Vec<(&'static str, Box<dyn BootloaderProvider>)>,
}

impl BootloaderRegistry {
    pub fn new() -> Self {
        let mut registry = BootloaderRegistry {
            providers: Vec::new(),
        };

        registry.register::<SyslinuxProvider>();
        registry.register::<GrubHybridProvider>();
        registry.register::<GrubBiosProvider>();
        registry.register::<GrubEfiProvider>();

        registry
    }

    fn register<T: BootloaderProvider + Default + 'static>(&mut self) {
        let provider: Box<dyn BootloaderProvider> = Box::new(T::default());
        let name = provider.name();
        // A later registration under the same name replaces the earlier one.
        self.providers.retain(|(existing, _)| *existing != name);
        self.providers.push((name, provider));
    }

    pub fn get(&self, name: &str) -> Result<&dyn BootloaderProvider, ConfigError> {
        self.providers
            .iter()
            .find(|(id, _)| *id == name)
            .map(|(_, provider)| provider.as_ref())
            .ok_or_else(|| ConfigError::UnknownBootloader {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|(name, _)| *name).collect()
    }

    pub fn providers(&self) -> impl Iterator<Item = &dyn BootloaderProvider> {
        self.providers.iter().map(|(_, provider)| provider.as_ref())
    }
}

impl Default for BootloaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Global registry instance
pub static REGISTRY: LazyLock<BootloaderRegistry> = LazyLock::new(BootloaderRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_order_is_stable() {
        assert_eq!(
            REGISTRY.names(),
            vec!["syslinux", "grub", "grub-bios", "grub-efi"]
        );
        assert_eq!(REGISTRY.providers().count(), 4);
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(REGISTRY.get("grub-efi").unwrap().name(), "grub-efi");
        let err = REGISTRY.get("lilo").err().unwrap();
        assert_eq!(
            err.to_string(),
            "unknown bootloader: lilo, available bootloaders are: syslinux, grub, grub-bios, grub-efi"
        );
    }

    #[test]
    fn reregistering_replaces() {
        let mut registry = BootloaderRegistry::new();
        registry.register::<SyslinuxProvider>();
        assert_eq!(registry.names().len(), 4);
        assert_eq!(registry.names().last(), Some(&"syslinux"));
    }
}
