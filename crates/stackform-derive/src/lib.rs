//! Provides derive macros for `form::HasDependencies`.
use quote::quote;
use syn::{Data, DataStruct, DeriveInput, Field, Fields};

/// Returns `true` if the field is marked `#[form(skip)]`.
fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for att in field.attrs.iter() {
        if att.path().is_ident("form") {
            att.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else {
                    Err(meta.error(format!(
                        "unsupported field attribute {:?} - must be 'skip'",
                        meta.path
                            .get_ident()
                            .map(|id| id.to_string())
                            .unwrap_or("unknown".to_string())
                    )))
                }
            })?;
        }
    }
    Ok(skip)
}

fn get_merges(input: &DeriveInput) -> syn::Result<Vec<proc_macro2::TokenStream>> {
    let fields = match &input.data {
        Data::Struct(DataStruct { fields, .. }) => fields,
        _ => {
            return Err(syn::Error::new(
                input.ident.span(),
                "deriving HasDependencies only supports structs, implement it by hand for enums",
            ));
        }
    };

    let mut merges = vec![];
    match fields {
        Fields::Named(named) => {
            for field in named.named.iter() {
                if is_skipped(field)? {
                    continue;
                }
                // UNWRAP: safe because named fields always have an ident
                let ident = field.ident.clone().unwrap();
                merges.push(quote! {
                    .merge(form::HasDependencies::dependencies(&self.#ident))
                });
            }
        }
        Fields::Unnamed(unnamed) => {
            for (i, field) in unnamed.unnamed.iter().enumerate() {
                if is_skipped(field)? {
                    continue;
                }
                let index = syn::Index::from(i);
                merges.push(quote! {
                    .merge(form::HasDependencies::dependencies(&self.#index))
                });
            }
        }
        Fields::Unit => {}
    }
    Ok(merges)
}

/// Derives `HasDependencies` by merging the dependencies of every field.
///
/// Fields that carry no tokens and don't implement `HasDependencies` can be
/// excluded with `#[form(skip)]`.
#[proc_macro_derive(HasDependencies, attributes(form))]
pub fn derive_has_dependencies(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input: DeriveInput = syn::parse_macro_input!(input);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let merges = match get_merges(&input) {
        Ok(m) => m,
        Err(e) => return e.into_compile_error().into(),
    };

    let output = quote! {
        impl #impl_generics form::HasDependencies for #name #ty_generics #where_clause {
            fn dependencies(&self) -> form::Dependencies {
                form::Dependencies::default()
                    #(#merges)*
            }
        }
    };
    output.into()
}
