//! Object lifecycle laws that need a quiet statistics window, kept in
//! their own test binary (one test) so no parallel test perturbs the
//! global counters.

mod common;

use edgex_kernel::ipc::event::{create_event, create_event_set, destroy_event, destroy_event_set};
use edgex_kernel::ipc::message::{create_message_queue, destroy_message_queue};
use edgex_kernel::ipc::mutex::{create_mutex, destroy_mutex};
use edgex_kernel::ipc::semaphore::{create_semaphore, destroy_semaphore};
use edgex_kernel::ipc::shared_memory::{
    create_shared_memory, destroy_shared_memory, ShmFlags, ShmPerms,
};
use edgex_kernel::ipc::{self, stats};

#[test]
fn create_destroy_returns_counters_to_baseline() {
    let (sched, _) = common::setup();
    common::set_current_pid(500);

    let before = stats::get();

    let mutex = create_mutex("law_mutex").unwrap();
    let sem = create_semaphore("law_sem", 1).unwrap();
    let event = create_event("law_event").unwrap();
    let set = create_event_set("law_set", 4).unwrap();
    let queue = create_message_queue("law_queue", 4).unwrap();
    let shm = create_shared_memory("law_shm", 4096, ShmPerms::RW, ShmFlags::CREATE).unwrap();

    let live = stats::get();
    assert_eq!(live.objects_created, before.objects_created + 6);
    assert_eq!(live.mutex_count, before.mutex_count + 1);
    assert_eq!(live.semaphore_count, before.semaphore_count + 1);
    assert_eq!(live.event_count, before.event_count + 1);
    assert_eq!(live.event_set_count, before.event_set_count + 1);
    assert_eq!(live.message_queue_count, before.message_queue_count + 1);
    assert_eq!(live.shared_memory_count, before.shared_memory_count + 1);

    assert!(ipc::check_health(), "live objects keep the subsystem healthy");

    destroy_mutex(&mutex).unwrap();
    destroy_semaphore(&sem).unwrap();
    destroy_event(&event).unwrap();
    destroy_event_set(&set).unwrap();
    destroy_message_queue(&queue).unwrap();
    destroy_shared_memory(&shm).unwrap();

    let after = stats::get();
    assert_eq!(after.mutex_count, before.mutex_count);
    assert_eq!(after.semaphore_count, before.semaphore_count);
    assert_eq!(after.event_count, before.event_count);
    assert_eq!(after.event_set_count, before.event_set_count);
    assert_eq!(after.message_queue_count, before.message_queue_count);
    assert_eq!(after.shared_memory_count, before.shared_memory_count);
    assert_eq!(after.objects_destroyed, before.objects_destroyed + 6);

    // Task exit destroys everything the dead task still owned.
    common::set_current_pid(501);
    let leaked_mutex = create_mutex("law_leaked_mutex").unwrap();
    let leaked_shm =
        create_shared_memory("law_leaked_shm", 4096, ShmPerms::RW, ShmFlags::CREATE).unwrap();
    leaked_shm.map(ShmPerms::RW).unwrap();
    leaked_mutex.lock().unwrap();

    sched.exit_task(501);

    assert_eq!(leaked_mutex.owner(), 0, "no mutex stays owned by the dead task");
    assert_eq!(leaked_shm.mapping_count(), 0, "no mapping survives its task");
    let cleaned = stats::get();
    assert_eq!(cleaned.mutex_count, before.mutex_count);
    assert_eq!(cleaned.shared_memory_count, before.shared_memory_count);

    assert!(ipc::check_health());
    ipc::dump_ipc_objects();
}
